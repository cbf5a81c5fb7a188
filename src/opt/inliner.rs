//! Method inlining.
//!
//! Walks the graph block by block looking for call sites whose lookup
//! resolved to concrete candidates. A monomorphic, inlinable site is
//! replaced by the callee's duplicated body; a polymorphic one is
//! demultiplexed into a type-test ladder whose segments hold either an
//! inlined body or a specialized call, joined by phis. Unresolvable sites
//! are left untouched; inlining never fails.

use tracing::debug;

use super::demux::{demultiplex, DemuxResult};
use super::duplicator::CodeDuplicator;
use crate::cfg::{BlockId, ControlFlowGraph, Opcode, OpcodeId, OpcodeKind, VarId};
use crate::host::ids::Id;
use crate::jit::{CalleeClass, Jit};
use crate::typing::constraint::{Candidate, LookupConstraint, TypeConstraint};
use crate::typing::context::TypeContext;

pub struct Inliner<'e> {
    engine: &'e Jit,
    mid: crate::host::model::MethodId,
    cfg: ControlFlowGraph,
    ctx: TypeContext,
    visited: Vec<bool>,
    work: Vec<BlockId>,
}

impl<'e> Inliner<'e> {
    pub fn new(
        engine: &'e Jit,
        mid: crate::host::model::MethodId,
        cfg: ControlFlowGraph,
        ctx: TypeContext,
    ) -> Inliner<'e> {
        let blocks = cfg.block_count();
        Inliner {
            engine,
            mid,
            cfg,
            ctx,
            visited: vec![false; blocks],
            work: Vec::new(),
        }
    }

    /// Run to fixpoint and hand the rewritten graph back.
    pub fn run(mut self) -> (ControlFlowGraph, TypeContext) {
        self.work.push(self.cfg.entry());

        'outer: while let Some(b) = self.work.pop() {
            self.visited[b.index()] = true;

            let ops = self.cfg.block(b).opcodes().to_vec();
            for (pos, &opid) in ops.iter().enumerate() {
                if !matches!(self.cfg.opcode(opid).kind, OpcodeKind::Call { .. }) {
                    continue;
                }
                if let Some(callee_name) = self.inline_call_site(b, pos, opid) {
                    // The block list grew; size the visited flags to match
                    // (new blocks start unvisited).
                    self.visited.resize(self.cfg.block_count(), false);
                    self.engine.record_callee_caller(callee_name, self.mid);
                    continue 'outer;
                }
            }

            for succ in self.cfg.successors_of(b) {
                if !self.visited[succ.index()] {
                    self.work.push(succ);
                }
            }
        }

        (self.cfg, self.ctx)
    }

    /// Attempt one call site; `Some(name)` when the graph was rewritten.
    fn inline_call_site(&mut self, block: BlockId, pos: usize, call_id: OpcodeId) -> Option<Id> {
        let call = self.cfg.opcode(call_id).kind.clone();
        let lookup_var = call.call_lookup();

        let lookup_def = self.cfg.variable(lookup_var).def_opcode()?;
        let (name, lookup_env, preset) = match &self.cfg.opcode(lookup_def).kind {
            OpcodeKind::Lookup { name, env, entry, .. } => (*name, *env, entry.is_some()),
            _ => return None,
        };
        if preset {
            // A call site this pass already specialized.
            return None;
        }

        let lookup = match self.ctx.type_of(lookup_var) {
            Some(TypeConstraint::Lookup(lc)) => lc.clone(),
            _ => return None,
        };
        let LookupConstraint {
            candidates,
            determined,
        } = lookup;
        let mut otherwise = !determined;

        let mut cases: Vec<Candidate> = Vec::new();
        let mut classes: Vec<CalleeClass> = Vec::new();
        for cand in candidates {
            match self.engine.classify_callee(cand, self.mid) {
                CalleeClass::Opaque => otherwise = true,
                class => {
                    cases.push(cand);
                    classes.push(class);
                }
            }
        }
        if cases.is_empty() {
            return None;
        }
        let single_inline =
            !otherwise && cases.len() == 1 && matches!(classes[0], CalleeClass::Inline(_));
        if !otherwise && cases.len() == 1 && !single_inline {
            // One known target we cannot splice; nothing to gain.
            return None;
        }

        debug!(
            method = %name,
            candidates = cases.len(),
            otherwise,
            "rewriting call site"
        );

        if single_inline {
            let join = self.cfg.split_block(block, pos, true);
            self.cfg.block_mut(join).set_name("inliner_join");
            let CalleeClass::Inline(inst) = classes.remove(0) else {
                unreachable!("checked above");
            };
            let (_, _, end) =
                self.splice_body(&inst, block, &call, call.lhs(), call.out_env(), lookup_env);
            self.append_jump(end, join);
        } else {
            let class_cases: Vec<_> = cases.iter().map(|c| c.klass).collect();
            let selector = call.call_receiver();
            let demux: DemuxResult = demultiplex(
                &mut self.cfg,
                &mut self.ctx,
                block,
                pos,
                selector,
                &class_cases,
                otherwise,
            );

            let total = cases.len() + otherwise as usize;
            for i in 0..total {
                let segment = demux.segments[i];
                let (result, env, end) = if i >= cases.len() {
                    // Open tail for receivers outside the case list.
                    self.insert_call(None, segment, &call, name, lookup_env)
                } else {
                    match &classes[i] {
                        CalleeClass::Inline(inst) => {
                            let inst = inst.clone();
                            self.splice_body(&inst, segment, &call, None, None, lookup_env)
                        }
                        CalleeClass::Specialize => {
                            self.insert_call(Some(cases[i]), segment, &call, name, lookup_env)
                        }
                        CalleeClass::Opaque => unreachable!("filtered out"),
                    }
                };
                self.append_jump(end, demux.exit_block);
                let index = self
                    .cfg
                    .block(demux.exit_block)
                    .backedge_index_of(end)
                    .expect("edge just wired");
                if let (Some(phi), Some(result)) = (demux.phi, result) {
                    self.set_phi_operand(phi, index, result);
                }
                if let Some(env_phi) = demux.env_phi {
                    self.set_phi_operand(env_phi, index, env);
                }
            }
        }

        // Drop the now-dead lookup; the variable stays, definition-less.
        let lookup_block = self.cfg.variable(lookup_var).def_block();
        self.cfg.remove_opcode(lookup_block, lookup_def);
        self.cfg.variable_mut(lookup_var).set_def_opcode(None);

        if cfg!(debug_assertions) {
            let errors = self.cfg.check_sanity();
            assert!(errors.is_empty(), "sanity after inlining: {:?}", errors);
            let errors = self.cfg.check_ssa();
            assert!(errors.is_empty(), "ssa after inlining: {:?}", errors);
        }

        Some(name)
    }

    /// Splice a duplicated callee body in at `entry_block`, wiring
    /// arguments in and the output/env out. Returns the result variable,
    /// the post-call env and the block execution falls out of.
    fn splice_body(
        &mut self,
        inst: &std::rc::Rc<std::cell::RefCell<crate::jit::CompilationInstance>>,
        entry_block: BlockId,
        call: &OpcodeKind,
        result: Option<VarId>,
        exit_env: Option<VarId>,
        caller_env: VarId,
    ) -> (Option<VarId>, VarId, BlockId) {
        let inst = inst.borrow();
        let callee_cfg = inst.cfg_ref().expect("inlinable callee has a cfg");
        let callee_ctx = inst
            .type_context_ref()
            .expect("inlinable callee is analyzed");

        let dup = CodeDuplicator::incorporate(callee_cfg, callee_ctx, &mut self.cfg, &mut self.ctx);

        // Bind the formals to the call's receiver and arguments.
        let args = call.call_receiver_and_args();
        for (&input, &arg) in callee_cfg.inputs().iter().zip(args.iter()) {
            let formal = dup.var_of(input);
            let op = self
                .cfg
                .append_opcode(entry_block, Opcode::new(OpcodeKind::Copy { lhs: formal, rhs: arg }));
            self.cfg
                .variable_mut(formal)
                .set_def_site(entry_block, Some(op));
        }

        // The callee's environment is the caller's at the call site: turn
        // the duplicated env producer into a copy so the identity chain is
        // explicit in the graph.
        let callee_env = dup.var_of(callee_cfg.entry_env());
        self.rebind_env_producer(dup.entry(), callee_env, caller_env);
        let env_alias = TypeConstraint::same_as(&self.ctx, caller_env);
        self.ctx.update(callee_env, env_alias);

        self.append_jump(entry_block, dup.entry());

        // Exit side: the duplicated exit block has no terminator.
        let end = dup.exit();
        let mut result_var = None;
        if let Some(original_lhs) = call.lhs() {
            let callee_output = dup.var_of(
                callee_cfg
                    .output()
                    .expect("inlinable callee produces a value"),
            );
            let target = match result {
                Some(r) => r,
                None => {
                    let r = self.cfg.copy_variable(end, None, original_lhs);
                    self.ctx.fit_size(&self.cfg);
                    let t = self.ctx.type_or_any(original_lhs).clone();
                    self.ctx.set(r, t);
                    r
                }
            };
            let op = self.cfg.append_opcode(
                end,
                Opcode::new(OpcodeKind::Copy {
                    lhs: target,
                    rhs: callee_output,
                }),
            );
            self.cfg.variable_mut(target).set_def_site(end, Some(op));
            result_var = Some(target);
        }

        let mut env = dup.var_of(callee_cfg.exit_env());
        if let Some(exit_env) = exit_env {
            let op = self.cfg.append_opcode(
                end,
                Opcode::new(OpcodeKind::Copy {
                    lhs: exit_env,
                    rhs: env,
                }),
            );
            self.cfg.variable_mut(exit_env).set_def_site(end, Some(op));
            env = exit_env;
        }

        self.work.push(dup.entry());

        (result_var, env, end)
    }

    /// Replace the duplicated `Env` producer with a copy from the caller's
    /// environment.
    fn rebind_env_producer(&mut self, dup_entry: BlockId, callee_env: VarId, caller_env: VarId) {
        let ops = self.cfg.block(dup_entry).opcodes().to_vec();
        for opid in ops {
            if let OpcodeKind::Env { lhs } = self.cfg.opcode(opid).kind {
                if lhs == callee_env {
                    self.cfg.opcode_mut(opid).kind = OpcodeKind::Copy {
                        lhs: callee_env,
                        rhs: caller_env,
                    };
                    return;
                }
            }
        }
    }

    /// Emit a fresh lookup/call pair into `entry_block`: specialized when
    /// a candidate is given, open for the `otherwise` tail.
    fn insert_call(
        &mut self,
        cand: Option<Candidate>,
        entry_block: BlockId,
        call: &OpcodeKind,
        name: Id,
        env: VarId,
    ) -> (Option<VarId>, VarId, BlockId) {
        let receiver = call.call_receiver();

        let lookup_lhs = self.cfg.create_variable(None, None, entry_block, None);
        let op = self.cfg.append_opcode(
            entry_block,
            Opcode::new(OpcodeKind::Lookup {
                lhs: lookup_lhs,
                receiver,
                name,
                env,
                entry: cand.map(|c| (c.klass, c.method)),
            }),
        );
        self.cfg.variable_mut(lookup_lhs).set_def_opcode(Some(op));
        self.ctx.fit_size(&self.cfg);
        self.ctx.set(
            lookup_lhs,
            TypeConstraint::Lookup(match cand {
                Some(c) => LookupConstraint {
                    candidates: vec![c],
                    determined: true,
                },
                None => LookupConstraint::default(),
            }),
        );

        let new_lhs = call
            .lhs()
            .map(|l| self.cfg.copy_variable(entry_block, None, l));
        let new_env = self
            .cfg
            .copy_variable(entry_block, None, call.out_env().expect("calls carry an env"));
        self.ctx.fit_size(&self.cfg);
        if let Some(v) = new_lhs {
            self.ctx.set(v, TypeConstraint::Any);
        }
        self.ctx.set(new_env, TypeConstraint::Env);

        let mut operands = crate::cfg::opcode::Operands::from_slice(call.call_receiver_and_args());
        operands.push(lookup_lhs);
        let call_op = self.cfg.append_opcode(
            entry_block,
            Opcode::new(OpcodeKind::Call {
                lhs: new_lhs,
                operands,
                code_block: None,
                out_env: new_env,
            }),
        );
        if let Some(v) = new_lhs {
            self.cfg.variable_mut(v).set_def_site(entry_block, Some(call_op));
        }
        self.cfg
            .variable_mut(new_env)
            .set_def_site(entry_block, Some(call_op));

        (new_lhs, new_env, entry_block)
    }

    fn append_jump(&mut self, from: BlockId, to: BlockId) {
        self.cfg
            .append_opcode(from, Opcode::new(OpcodeKind::Jump { target: to }));
        self.cfg.block_mut(to).add_backedge(from);
    }

    fn set_phi_operand(&mut self, phi: OpcodeId, index: usize, v: VarId) {
        if let OpcodeKind::Phi { operands, .. } = &mut self.cfg.opcode_mut(phi).kind {
            operands[index] = v;
        }
    }
}
