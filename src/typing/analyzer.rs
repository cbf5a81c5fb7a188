//! Abstract-interpretation type analysis.
//!
//! A fixed-point iteration over the constraint lattice with conditional
//! edge reachability: blocks become reachable as branches are proved
//! takeable, and phi joins only consider operands arriving over reachable
//! edges. Termination rests on the bounded lattice height per variable
//! (`Selection` and subclass expansion cap at
//! [`crate::typing::constraint::MAX_CANDIDATE_COUNT`]).
//!
//! The analyzer is generic over a [`MethodOracle`], the seam through which
//! it asks about callees (return types, purity) and reports constant
//! references. Recursion handling lives behind the oracle: a query against
//! a method currently being analyzed yields its `Recursion` constraint.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::{debug, trace};

use crate::analysis::defuse::DefUseChain;
use crate::cfg::{BlockId, ControlFlowGraph, OpcodeId, OpcodeKind, VarId};
use crate::host::ids::{self, Id};
use crate::host::model::{builtin, ClassId, HostModel};
use crate::host::primitives;
use crate::host::value::Value;
use crate::typing::constraint::{
    Boolean, Candidate, LookupConstraint, TypeConstraint, TypeSelection,
};
use crate::typing::context::TypeContext;

/// What the analyzer knows about one call candidate.
#[derive(Debug, Clone)]
pub enum CalleeSummary {
    /// The callee's return type and purity are known (analyzed AST method
    /// or annotated native).
    Known {
        return_type: TypeConstraint,
        mutator: bool,
    },
    /// Nothing is known beyond a mutator judgement; the call result is
    /// `Any`.
    Unknown { mutator: bool },
}

/// The analyzer's window onto the rest of the engine.
pub trait MethodOracle {
    fn host(&self) -> &HostModel;

    /// Summarize a call candidate, analyzing it first if needed.
    fn callee_summary(&self, candidate: Candidate) -> CalleeSummary;

    /// A compiled method referenced constant `name`; recorded for
    /// invalidation.
    fn record_constant_referrer(&self, name: Id) {
        let _ = name;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

/// Everything the analysis produced.
pub struct AnalysisResult {
    pub ctx: TypeContext,
    /// True when some reachable call or constant may redefine methods.
    pub mutator: bool,
    /// True when the method uses primitives and therefore only exists in
    /// compiled form.
    pub jit_only: bool,
    pub reachable_blocks: Vec<bool>,
}

pub struct TypeAnalyzer<'a, O: MethodOracle + ?Sized> {
    cfg: &'a ControlFlowGraph,
    oracle: &'a O,
    /// Lexical constant-resolution chain, innermost first.
    cref: Vec<ClassId>,

    ctx: TypeContext,
    reach_blocks: Vec<Reachability>,
    reach_edges: HashMap<(BlockId, BlockId), Reachability>,
    block_work: Vec<BlockId>,
    var_work: Vec<VarId>,
    def_use: DefUseChain,
    mutator: bool,
    jit_only: bool,
    current_block: BlockId,
}

impl<'a, O: MethodOracle + ?Sized> TypeAnalyzer<'a, O> {
    pub fn new(cfg: &'a ControlFlowGraph, oracle: &'a O, cref: Vec<ClassId>) -> Self {
        TypeAnalyzer {
            cfg,
            oracle,
            cref,
            ctx: TypeContext::new(cfg),
            reach_blocks: vec![Reachability::Unknown; cfg.block_count()],
            reach_edges: HashMap::new(),
            block_work: Vec::new(),
            var_work: Vec::new(),
            def_use: DefUseChain::build(cfg),
            mutator: false,
            jit_only: false,
            current_block: cfg.entry(),
        }
    }

    /// Constrain a formal parameter before analysis starts.
    pub fn set_input_type(&mut self, index: usize, t: TypeConstraint) {
        let v = self.cfg.inputs()[index];
        self.ctx.set(v, t);
    }

    pub fn analyze(mut self) -> AnalysisResult {
        for v in self.cfg.var_ids() {
            if self.ctx.type_of(v).is_none() {
                self.ctx.set(v, TypeConstraint::Any);
            }
        }

        self.block_work.push(self.cfg.entry());
        loop {
            while let Some(b) = self.block_work.pop() {
                self.visit_block(b);
            }
            while let Some(v) = self.var_work.pop() {
                let uses: Vec<(BlockId, OpcodeId)> = self.def_use.uses(v).to_vec();
                for (block, op) in uses {
                    self.current_block = block;
                    self.visit_opcode(op);
                }
            }
            if self.block_work.is_empty() {
                break;
            }
        }

        debug!(mutator = self.mutator, jit_only = self.jit_only, "type analysis converged");
        AnalysisResult {
            reachable_blocks: self
                .reach_blocks
                .iter()
                .map(|r| *r == Reachability::Reachable)
                .collect(),
            ctx: self.ctx,
            mutator: self.mutator,
            jit_only: self.jit_only,
        }
    }

    // ------------------------------------------------------------------
    // Worklist plumbing
    // ------------------------------------------------------------------

    fn update_type(&mut self, v: Option<VarId>, t: TypeConstraint) {
        let Some(v) = v else { return };
        if self.ctx.update(v, t) {
            trace!(var = ?v, "type changed");
            if !self.var_work.contains(&v) {
                self.var_work.push(v);
            }
        }
    }

    fn make_edge_reachable(&mut self, from: BlockId, to: BlockId) {
        let slot = self
            .reach_edges
            .entry((from, to))
            .or_insert(Reachability::Unknown);
        if *slot == Reachability::Reachable {
            // No need to revisit the target.
            return;
        }
        *slot = Reachability::Reachable;
        self.block_work.push(to);
    }

    fn make_edge_unreachable(&mut self, from: BlockId, to: BlockId) {
        self.reach_edges
            .insert((from, to), Reachability::Unreachable);
    }

    fn edge_reachable(&self, from: BlockId, to: BlockId) -> bool {
        self.reach_edges.get(&(from, to)) == Some(&Reachability::Reachable)
    }

    fn visit_block(&mut self, b: BlockId) {
        self.reach_blocks[b.index()] = Reachability::Reachable;
        self.current_block = b;
        for opid in self.cfg.block(b).opcodes().to_vec() {
            self.visit_opcode(opid);
        }
    }

    // ------------------------------------------------------------------
    // Transfer functions
    // ------------------------------------------------------------------

    fn visit_opcode(&mut self, opid: OpcodeId) {
        let kind = &self.cfg.opcode(opid).kind;
        match kind {
            OpcodeKind::Copy { lhs, rhs } => {
                let t = match self.ctx.type_or_any(*rhs) {
                    // Copying an environment preserves its identity.
                    TypeConstraint::Env => TypeConstraint::same_as(&self.ctx, *rhs),
                    other => other.clone(),
                };
                self.update_type(Some(*lhs), t);
            }
            OpcodeKind::Jump { target } => {
                let from = self.current_block;
                self.make_edge_reachable(from, *target);
            }
            OpcodeKind::JumpIf {
                cond,
                if_true,
                if_false,
            } => {
                let from = self.current_block;
                let (if_true, if_false) = (*if_true, *if_false);
                let verdict = self
                    .ctx
                    .type_or_any(*cond)
                    .evaluates_to_boolean(&self.ctx, self.oracle.host());
                match verdict {
                    Boolean::AlwaysTrue => {
                        self.make_edge_reachable(from, if_true);
                        self.make_edge_unreachable(from, if_false);
                    }
                    Boolean::AlwaysFalse => {
                        self.make_edge_unreachable(from, if_true);
                        self.make_edge_reachable(from, if_false);
                    }
                    Boolean::TrueOrFalse => {
                        self.make_edge_reachable(from, if_true);
                        self.make_edge_reachable(from, if_false);
                    }
                }
            }
            OpcodeKind::Immediate { lhs, value } => {
                self.update_type(Some(*lhs), TypeConstraint::Constant(value.clone()));
            }
            OpcodeKind::Env { lhs } => {
                self.update_type(Some(*lhs), TypeConstraint::Env);
            }
            OpcodeKind::Lookup {
                lhs,
                receiver,
                name,
                env,
                entry,
            } => self.visit_lookup(*lhs, *receiver, *name, *env, *entry),
            OpcodeKind::Call { .. } => self.visit_call(opid),
            OpcodeKind::CodeBlock { lhs, .. } => {
                self.update_type(Some(*lhs), TypeConstraint::Any);
            }
            OpcodeKind::Constant {
                lhs,
                name,
                base,
                toplevel,
                in_env,
                out_env,
            } => self.visit_constant(*lhs, *name, *base, *toplevel, *in_env, *out_env),
            OpcodeKind::Primitive { lhs, name, args } => {
                let (lhs, name) = (*lhs, *name);
                let args = args.clone();
                self.visit_primitive(lhs, name, &args);
            }
            OpcodeKind::Phi { lhs, operands, block } => {
                let (lhs, block) = (*lhs, *block);
                let operands = operands.clone();
                self.visit_phi(lhs, &operands, block);
            }
            OpcodeKind::Array { lhs, .. } => {
                self.update_type(*lhs, TypeConstraint::ExactClass(builtin::ARRAY));
            }
            OpcodeKind::Range { lhs, .. } => {
                self.update_type(*lhs, TypeConstraint::ExactClass(builtin::RANGE));
            }
            OpcodeKind::String { lhs, .. } => {
                self.update_type(Some(*lhs), TypeConstraint::ExactClass(builtin::STRING));
            }
            OpcodeKind::Hash { lhs, .. } => {
                self.update_type(*lhs, TypeConstraint::ExactClass(builtin::HASH));
            }
            OpcodeKind::Exit
            | OpcodeKind::Enter
            | OpcodeKind::Leave
            | OpcodeKind::CheckArg => {}
        }
    }

    fn visit_lookup(
        &mut self,
        lhs: VarId,
        receiver: VarId,
        name: Id,
        env: VarId,
        entry: Option<(ClassId, crate::host::model::MethodId)>,
    ) {
        // A lookup is only meaningful under the entry environment: after a
        // possible mutator, resolution results may have changed.
        if !self.ctx.is_same_value(env, self.cfg.entry_env()) {
            self.update_type(Some(lhs), TypeConstraint::Lookup(LookupConstraint::default()));
            return;
        }

        // A pre-resolved lookup (inliner-specialized call site) keeps its
        // single candidate; the type test guarding it already narrowed the
        // receiver.
        if let Some((klass, method)) = entry {
            self.update_type(
                Some(lhs),
                TypeConstraint::Lookup(LookupConstraint {
                    candidates: vec![Candidate { klass, method }],
                    determined: true,
                }),
            );
            return;
        }

        let host = self.oracle.host();
        let mut list = self
            .ctx
            .type_or_any(receiver)
            .resolve(&self.ctx, host);

        // Arithmetic on undetermined receivers is overwhelmingly fixnum
        // arithmetic; speculate on it so the demux can insert a guard.
        if !list.is_determined() && is_builtin_arith(name) && !list.includes(builtin::FIXNUM) {
            list.add(builtin::FIXNUM);
        }

        let mut lookup = LookupConstraint {
            candidates: Vec::new(),
            determined: list.is_determined(),
        };
        for &klass in list.classes() {
            if let Some(method) = host.find_method(klass, name) {
                let cand = Candidate { klass, method };
                if !lookup.includes(cand) {
                    lookup.candidates.push(cand);
                }
            }
        }

        self.update_type(Some(lhs), TypeConstraint::Lookup(lookup));
    }

    fn visit_call(&mut self, opid: OpcodeId) {
        let (lhs, out_env, lookup_var) = match &self.cfg.opcode(opid).kind {
            OpcodeKind::Call { lhs, out_env, .. } => {
                (*lhs, *out_env, self.cfg.opcode(opid).kind.call_lookup())
            }
            _ => unreachable!("not a call"),
        };

        let lookup = match self.ctx.type_of(lookup_var) {
            Some(TypeConstraint::Lookup(lc)) => lc.clone(),
            _ => LookupConstraint::default(),
        };

        if lookup.candidates.is_empty() {
            self.update_type(lhs, TypeConstraint::Any);
        } else {
            let mut sel = TypeSelection::new();
            let mut all_known = true;
            for cand in &lookup.candidates {
                match self.oracle.callee_summary(*cand) {
                    CalleeSummary::Known {
                        return_type,
                        mutator,
                    } => {
                        sel.add(return_type);
                        self.mutator = self.mutator || mutator;
                    }
                    CalleeSummary::Unknown { mutator } => {
                        self.mutator = self.mutator || mutator;
                        sel.clear();
                        all_known = false;
                        break;
                    }
                }
            }

            if lhs.is_some() {
                let t = if lookup.determined && all_known {
                    if sel.is_empty() {
                        TypeConstraint::Any
                    } else {
                        sel.into_constraint()
                    }
                } else {
                    sel.add(TypeConstraint::Any);
                    sel.into_constraint()
                };
                self.update_type(lhs, t);
            }
        }

        // The out-env is the purity signal: past a potential mutator the
        // environment is a fresh token, severing lookup validity.
        if self.mutator {
            self.update_type(Some(out_env), TypeConstraint::Env);
        } else {
            let in_env = self.lookup_env_operand(lookup_var);
            let t = match in_env {
                Some(env) => TypeConstraint::same_as(&self.ctx, env),
                None => TypeConstraint::Env,
            };
            self.update_type(Some(out_env), t);
        }
    }

    fn lookup_env_operand(&self, lookup_var: VarId) -> Option<VarId> {
        let def = self.cfg.variable(lookup_var).def_opcode()?;
        match &self.cfg.opcode(def).kind {
            OpcodeKind::Lookup { env, .. } => Some(*env),
            _ => None,
        }
    }

    fn visit_constant(
        &mut self,
        lhs: Option<VarId>,
        name: Id,
        base: VarId,
        toplevel: bool,
        in_env: VarId,
        out_env: VarId,
    ) {
        use crate::host::model::ConstantLookup;

        self.oracle.record_constant_referrer(name);
        let host = self.oracle.host();

        if !self.ctx.is_same_value(in_env, self.cfg.entry_env()) {
            self.update_type(lhs, TypeConstraint::Any);
            self.update_type(Some(out_env), TypeConstraint::Env);
            return;
        }

        if toplevel {
            let t = match host.find_constant(builtin::OBJECT, name) {
                ConstantLookup::Found(v) => TypeConstraint::Constant(v),
                ConstantLookup::Autoload => {
                    self.mutator = true;
                    TypeConstraint::Any
                }
                ConstantLookup::Missing => TypeConstraint::None,
            };
            self.update_type(lhs, t);
            self.finish_constant_env(out_env, in_env);
            return;
        }

        let (values, mut determined) = self
            .ctx
            .type_or_any(base)
            .resolve_to_values(&self.ctx);

        if determined && values.len() == 1 && values[0].is_nil() {
            // Free constant reference: resolve along the cref chain.
            let t = match host.find_constant_cref(&self.cref, name) {
                ConstantLookup::Found(v) => TypeConstraint::Constant(v),
                ConstantLookup::Autoload => {
                    self.mutator = true;
                    TypeConstraint::Any
                }
                ConstantLookup::Missing => TypeConstraint::None,
            };
            self.update_type(lhs, t);
            self.finish_constant_env(out_env, in_env);
            return;
        }

        // Relative reference: look the name up in every possible base.
        let base_classes: Vec<ClassId> =
            values.iter().filter_map(|v| v.as_class()).collect();

        if base_classes.is_empty() {
            if determined {
                // Guaranteed to raise at runtime; nothing flows out.
                self.update_type(lhs, TypeConstraint::None);
            } else {
                self.update_type(lhs, TypeConstraint::Any);
                self.mutator = true;
            }
            self.finish_constant_env(out_env, in_env);
            return;
        }

        let mut sel = TypeSelection::new();
        for base_class in base_classes {
            match host.find_constant(base_class, name) {
                ConstantLookup::Found(v) => sel.add(TypeConstraint::Constant(v)),
                ConstantLookup::Autoload => {
                    determined = false;
                    sel.add(TypeConstraint::Any);
                    self.mutator = true;
                }
                ConstantLookup::Missing => {
                    determined = false;
                }
            }
        }
        if !determined {
            sel.add(TypeConstraint::Any);
        }
        if lhs.is_some() {
            let t = if sel.is_empty() {
                TypeConstraint::None
            } else {
                sel.into_constraint()
            };
            self.update_type(lhs, t);
        }
        self.finish_constant_env(out_env, in_env);
    }

    fn finish_constant_env(&mut self, out_env: VarId, in_env: VarId) {
        if self.mutator {
            self.update_type(Some(out_env), TypeConstraint::Env);
        } else {
            let t = TypeConstraint::same_as(&self.ctx, in_env);
            self.update_type(Some(out_env), t);
        }
    }

    fn visit_primitive(&mut self, lhs: Option<VarId>, name: Id, args: &[VarId]) {
        self.jit_only = true;

        let Some(lhs) = lhs else { return };

        let class_test = if name == primitives::is_fixnum_name() {
            Some(builtin::FIXNUM)
        } else if name == primitives::is_true_name() {
            Some(builtin::TRUE_CLASS)
        } else if name == primitives::is_false_name() {
            Some(builtin::FALSE_CLASS)
        } else if name == primitives::is_nil_name() {
            Some(builtin::NIL_CLASS)
        } else {
            None
        };

        if let Some(cls) = class_test {
            let Some(&arg) = args.first() else { return };
            let host = self.oracle.host();
            let t = self.ctx.type_or_any(arg).clone();
            let result = if t.is_exact_class(&self.ctx, host, cls) {
                TypeConstraint::Constant(Value::Bool(true))
            } else if t.is_impossible_to_be_class(&self.ctx, host, cls) {
                TypeConstraint::Constant(Value::Bool(false))
            } else {
                TypeConstraint::Selection(vec![
                    TypeConstraint::Constant(Value::Bool(true)),
                    TypeConstraint::Constant(Value::Bool(false)),
                ])
            };
            self.update_type(Some(lhs), result);
            return;
        }

        if name == primitives::typecast_fixnum_name() {
            self.update_type(Some(lhs), TypeConstraint::ExactClass(builtin::FIXNUM));
            return;
        }
        if name == primitives::typecast_fixnum_bignum_name() {
            self.update_type(
                Some(lhs),
                TypeConstraint::Selection(vec![
                    TypeConstraint::ExactClass(builtin::FIXNUM),
                    TypeConstraint::ExactClass(builtin::BIGNUM),
                ]),
            );
            return;
        }

        // Every other primitive carries its result type in the catalogue.
        if let Some(p) = primitives::global_primitive_store().get(name) {
            self.update_type(Some(lhs), p.result);
        }
    }

    fn visit_phi(&mut self, lhs: VarId, operands: &[VarId], block: BlockId) {
        let backedges = self.cfg.block(block).backedges().to_vec();
        let mut sel = TypeSelection::new();
        for (&operand, &pred) in operands.iter().zip_eq(backedges.iter()) {
            if !self.edge_reachable(pred, block) {
                continue;
            }
            let Some(t) = self.ctx.type_of(operand) else {
                continue;
            };
            if matches!(t, TypeConstraint::Env) {
                // Preserve identity when joining environments.
                sel.add(TypeConstraint::same_as(&self.ctx, operand));
            } else {
                sel.add(t.clone());
            }
        }

        let t = if sel.is_empty() {
            TypeConstraint::Any
        } else {
            sel.into_constraint()
        };
        self.update_type(Some(lhs), t);
    }
}

fn is_builtin_arith(name: Id) -> bool {
    name == ids::op_plus()
        || name == ids::op_minus()
        || name == ids::op_star()
        || name == ids::op_slash()
}
