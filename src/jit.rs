//! The compilation engine.
//!
//! One [`Jit`] serves one host interpreter. It owns the host model, the
//! per-method [`CompilationInstance`]s, the mutator tester and the
//! recompilation manager. The per-method pipeline is:
//!
//! ```text
//! AST -> CFG build -> dominators -> SSA (copy folding) -> snapshot
//!     -> type analysis -> inlining -> type analysis -> code generator
//! ```
//!
//! Compilation is single-threaded and runs to completion per entry point.
//! Recursive type queries are answered through a per-instance lock: a
//! query against a method currently under analysis yields its `Recursion`
//! constraint instead of descending forever.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::analysis::dominators::find_dominators;
use crate::analysis::domtree::DomTree;
use crate::analysis::ssa::SsaTranslator;
use crate::builder::build_method;
use crate::cfg::{ControlFlowGraph, Scope};
use crate::error::{CompileError, CompileResult};
use crate::host::ast::NodeRef;
use crate::host::ids::Id;
use crate::host::model::{ClassId, HostModel, MethodBody, MethodId, MutatorTester};
use crate::opt::duplicator::CodeDuplicator;
use crate::opt::inliner::Inliner;
use crate::recompile::RecompilationManager;
use crate::typing::analyzer::{AnalysisResult, CalleeSummary, MethodOracle, TypeAnalyzer};
use crate::typing::constraint::{Candidate, TypeConstraint};
use crate::typing::context::TypeContext;

/// Per-method compilation state.
///
/// Created lazily the first time the engine needs the method, kept across
/// recompilations. `orig_cfg` snapshots the pre-inlining graph so
/// invalidation can restore it.
pub struct CompilationInstance {
    pub method: MethodId,
    pub holder: ClassId,
    pub name: Id,
    source: NodeRef,
    cref: Vec<ClassId>,

    cfg: Option<ControlFlowGraph>,
    orig_cfg: Option<ControlFlowGraph>,
    scope: Option<Scope>,
    type_context: Option<TypeContext>,
    return_type: Option<TypeConstraint>,
    mutator: Option<bool>,
    jit_only: Option<bool>,

    /// Extra per-parameter constraints the host supplied for this
    /// compilation (index into the CFG inputs, constraint).
    input_types: Vec<(usize, TypeConstraint)>,

    /// Set while this instance is being analyzed; queries under the lock
    /// resolve to `Recursion`.
    lock: bool,
}

impl CompilationInstance {
    pub fn cfg_ref(&self) -> Option<&ControlFlowGraph> {
        self.cfg.as_ref()
    }

    pub fn original_cfg_ref(&self) -> Option<&ControlFlowGraph> {
        self.orig_cfg.as_ref()
    }

    pub fn scope_ref(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn type_context_ref(&self) -> Option<&TypeContext> {
        self.type_context.as_ref()
    }

    pub fn return_type_ref(&self) -> Option<&TypeConstraint> {
        self.return_type.as_ref()
    }

    pub fn is_mutator(&self) -> bool {
        self.mutator.unwrap_or(false)
    }

    pub fn is_jit_only(&self) -> bool {
        self.jit_only.unwrap_or(false)
    }

    /// Throw away every optimization product, restoring the pre-inlining
    /// snapshot when one exists.
    fn reset(&mut self) {
        if self.cfg.is_none() {
            return;
        }
        if let Some(orig) = self.orig_cfg.take() {
            self.cfg = Some(orig);
        }
        self.type_context = None;
        self.return_type = None;
        self.mutator = None;
        self.jit_only = None;
    }
}

/// How the inliner may treat one call candidate.
pub(crate) enum CalleeClass {
    /// Analyzed AST body available for splicing.
    Inline(Rc<RefCell<CompilationInstance>>),
    /// Known entry without a usable body: emit a pre-resolved call.
    Specialize,
    /// Nothing known: fold into the `otherwise` tail.
    Opaque,
}

/// The method-level JIT engine.
pub struct Jit {
    host: HostModel,
    instances: RefCell<HashMap<MethodId, Rc<RefCell<CompilationInstance>>>>,
    recompilation: RefCell<RecompilationManager>,
    mutators: MutatorTester,
}

impl Jit {
    pub fn new(host: HostModel) -> Jit {
        Jit {
            host,
            instances: RefCell::new(HashMap::new()),
            recompilation: RefCell::new(RecompilationManager::new()),
            mutators: MutatorTester::new(),
        }
    }

    pub fn host(&self) -> &HostModel {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut HostModel {
        &mut self.host
    }

    pub fn mutator_tester_mut(&mut self) -> &mut MutatorTester {
        &mut self.mutators
    }

    pub fn recompilation_manager(&self) -> std::cell::Ref<'_, RecompilationManager> {
        self.recompilation.borrow()
    }

    /// The compilation instance of an AST method, if one exists yet.
    pub fn instance(&self, mid: MethodId) -> Option<Rc<RefCell<CompilationInstance>>> {
        self.instances.borrow().get(&mid).cloned()
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Compile one method end to end: build, SSA, snapshot, analyze,
    /// inline, re-analyze, and install the JIT definition.
    pub fn compile(&mut self, mid: MethodId) -> CompileResult<()> {
        self.compile_with_inputs(mid, &[])
    }

    /// Like [`Self::compile`], with additional parameter constraints the
    /// host knows at entry (input index, constraint). Input 0, the
    /// receiver, is always constrained to the holder class hierarchy.
    pub fn compile_with_inputs(
        &mut self,
        mid: MethodId,
        inputs: &[(usize, TypeConstraint)],
    ) -> CompileResult<()> {
        self.ensure_cfg(mid)?;

        // Snapshot the pre-inlining graph for invalidation.
        let inst = self.instance_or_create(mid)?;
        inst.borrow_mut().input_types = inputs.to_vec();
        {
            let snapshot = {
                let i = inst.borrow();
                CodeDuplicator::duplicate(i.cfg.as_ref().expect("cfg just built"))
            };
            if cfg!(debug_assertions) {
                let errors = snapshot.check_sanity();
                assert!(errors.is_empty(), "snapshot sanity: {:?}", errors);
            }
            inst.borrow_mut().orig_cfg = Some(snapshot);
        }

        self.analyze_types(mid)?;

        // Inline, then re-run the analyzer over the rewritten graph.
        let (cfg, ctx) = {
            let mut i = inst.borrow_mut();
            (
                i.cfg.take().expect("cfg present"),
                i.type_context.take().expect("types present"),
            )
        };
        let (cfg, _stale_ctx) = Inliner::new(self, mid, cfg, ctx).run();

        let (holder, cref, input_types) = {
            let i = inst.borrow();
            (i.holder, i.cref.clone(), i.input_types.clone())
        };
        let result = self.run_analyzer(&cfg, mid, holder, cref, &input_types);
        let return_type = Self::output_type(&cfg, &result);
        {
            let mut i = inst.borrow_mut();
            i.cfg = Some(cfg);
            i.type_context = Some(result.ctx);
            i.return_type = Some(return_type);
            i.mutator = Some(result.mutator);
            i.jit_only = Some(result.jit_only);
        }

        self.host.method_mut(mid).jit_installed = true;
        debug!(method = ?mid, "compiled and installed");
        Ok(())
    }

    /// Build the CFG and translate it to SSA, once.
    pub fn ensure_cfg(&self, mid: MethodId) -> CompileResult<()> {
        let inst = self.instance_or_create(mid)?;
        if inst.borrow().cfg.is_some() {
            return Ok(());
        }

        let (source, name) = {
            let i = inst.borrow();
            (i.source.clone(), i.name)
        };
        // Errors leave the instance untouched: no partial CFG escapes.
        let built = build_method(&source, name)?;
        let mut cfg = built.cfg;
        let mut def_info = built.def_info;

        let idoms = find_dominators(&cfg);
        let tree = DomTree::build(&cfg, &idoms);
        cfg.set_dom_tree(tree.clone());
        SsaTranslator::new(&mut cfg, &mut def_info, tree, true).translate();

        if cfg!(debug_assertions) {
            let errors = cfg.check_sanity();
            assert!(errors.is_empty(), "sanity after ssa: {:?}", errors);
            let errors = cfg.check_ssa();
            assert!(errors.is_empty(), "ssa check: {:?}", errors);
        }

        let mut i = inst.borrow_mut();
        i.cfg = Some(cfg);
        i.scope = Some(built.scope);
        Ok(())
    }

    /// Run type analysis, caching the results on the instance. A no-op on
    /// a locked (currently analyzing) instance.
    pub fn analyze_types(&self, mid: MethodId) -> CompileResult<()> {
        let inst = self.instance_or_create(mid)?;
        if inst.borrow().lock {
            return Ok(());
        }
        self.ensure_cfg(mid)?;

        let (cfg, holder, cref, input_types) = {
            let mut i = inst.borrow_mut();
            i.lock = true;
            (
                i.cfg.take().expect("cfg just ensured"),
                i.holder,
                i.cref.clone(),
                i.input_types.clone(),
            )
        };

        let result = self.run_analyzer(&cfg, mid, holder, cref, &input_types);
        let return_type = Self::output_type(&cfg, &result);

        let mut i = inst.borrow_mut();
        i.cfg = Some(cfg);
        i.type_context = Some(result.ctx);
        i.return_type = Some(return_type);
        i.mutator = Some(result.mutator);
        i.jit_only = Some(result.jit_only);
        i.lock = false;
        Ok(())
    }

    fn run_analyzer(
        &self,
        cfg: &ControlFlowGraph,
        mid: MethodId,
        holder: ClassId,
        cref: Vec<ClassId>,
        input_types: &[(usize, TypeConstraint)],
    ) -> AnalysisResult {
        let handle = AnalysisHandle { jit: self, mid };
        let mut analyzer = TypeAnalyzer::new(cfg, &handle, cref);
        analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(holder));
        for (index, t) in input_types {
            analyzer.set_input_type(*index, t.clone());
        }
        analyzer.analyze()
    }

    /// Return type of a finished analysis: the output's constraint with
    /// aliases resolved away, bottom for a method that never returns.
    fn output_type(cfg: &ControlFlowGraph, result: &AnalysisResult) -> TypeConstraint {
        match cfg.output() {
            Some(out) => result.ctx.type_or_any(out).independent_clone(&result.ctx),
            None => TypeConstraint::None,
        }
    }

    // ------------------------------------------------------------------
    // Callee queries
    // ------------------------------------------------------------------

    fn instance_or_create(&self, mid: MethodId) -> CompileResult<Rc<RefCell<CompilationInstance>>> {
        if let Some(rc) = self.instances.borrow().get(&mid) {
            return Ok(rc.clone());
        }
        let def = self.host.method(mid);
        let MethodBody::Ast(node) = &def.body else {
            return Err(CompileError::MissingMethodBody {
                method: def.name.name().to_string(),
            });
        };
        let inst = CompilationInstance {
            method: mid,
            holder: def.owner,
            name: def.name,
            source: node.clone(),
            cref: vec![def.owner],
            cfg: None,
            orig_cfg: None,
            scope: None,
            type_context: None,
            return_type: None,
            mutator: None,
            jit_only: None,
            input_types: Vec::new(),
            lock: false,
        };
        let rc = Rc::new(RefCell::new(inst));
        self.instances.borrow_mut().insert(mid, rc.clone());
        Ok(rc)
    }

    pub(crate) fn callee_summary(&self, cand: Candidate) -> CalleeSummary {
        let def = self.host.method(cand.method);
        match &def.body {
            MethodBody::Native {
                info: Some(info), ..
            } => CalleeSummary::Known {
                return_type: info.return_type.clone(),
                mutator: info.mutator,
            },
            MethodBody::Native { info: None, .. } => CalleeSummary::Unknown {
                mutator: self.mutators.is_mutator(def),
            },
            MethodBody::Ast(_) => {
                let Ok(inst) = self.instance_or_create(cand.method) else {
                    return CalleeSummary::Unknown { mutator: true };
                };
                {
                    let i = inst.borrow();
                    if i.lock {
                        // Re-entry: answer with the fixpoint guard. The
                        // caller's own state will determine the final
                        // mutator/jit-only answers.
                        return CalleeSummary::Known {
                            return_type: TypeConstraint::Recursion(cand.method),
                            mutator: false,
                        };
                    }
                    if let Some(rt) = &i.return_type {
                        return CalleeSummary::Known {
                            return_type: rt.clone(),
                            mutator: i.is_mutator(),
                        };
                    }
                }
                match self.analyze_types(cand.method) {
                    Ok(()) => {
                        let i = inst.borrow();
                        CalleeSummary::Known {
                            return_type: i
                                .return_type
                                .clone()
                                .unwrap_or(TypeConstraint::Any),
                            mutator: i.is_mutator(),
                        }
                    }
                    // An uncompilable callee is an opaque one.
                    Err(_) => CalleeSummary::Unknown { mutator: true },
                }
            }
        }
    }

    pub(crate) fn classify_callee(&self, cand: Candidate, self_mid: MethodId) -> CalleeClass {
        let def = self.host.method(cand.method);
        match &def.body {
            MethodBody::Native {
                info: Some(_), ..
            } => CalleeClass::Specialize,
            MethodBody::Native { info: None, .. } => CalleeClass::Opaque,
            MethodBody::Ast(_) => {
                if cand.method == self_mid {
                    // Direct recursion never inlines.
                    return CalleeClass::Specialize;
                }
                if self.analyze_types(cand.method).is_err() {
                    return CalleeClass::Opaque;
                }
                let Ok(inst) = self.instance_or_create(cand.method) else {
                    return CalleeClass::Opaque;
                };
                let usable = {
                    let i = inst.borrow();
                    !i.lock
                        && i.type_context.is_some()
                        && i.cfg.as_ref().is_some_and(|c| c.output().is_some())
                };
                if usable {
                    CalleeClass::Inline(inst)
                } else {
                    CalleeClass::Specialize
                }
            }
        }
    }

    pub(crate) fn record_callee_caller(&self, callee: Id, caller: MethodId) {
        self.recompilation
            .borrow_mut()
            .add_callee_caller(callee, caller);
    }

    // ------------------------------------------------------------------
    // Host redefinition callbacks
    // ------------------------------------------------------------------

    /// The host redefined method `name`: invalidate every compiled caller
    /// that inlined or specialized it.
    pub fn notify_method_redefined(&mut self, name: Id) {
        let callers = self.recompilation.borrow_mut().take_callers(name);
        for mid in callers {
            self.restore_original_definition(mid);
        }
    }

    /// The host redefined constant `name`: invalidate its referrers.
    pub fn notify_constant_redefined(&mut self, name: Id) {
        let referrers = self.recompilation.borrow_mut().take_referrers(name);
        for mid in referrers {
            self.restore_original_definition(mid);
        }
    }

    /// Swap the method back to its interpreted definition and reset its
    /// compilation instance to the pre-inlining snapshot.
    pub fn restore_original_definition(&mut self, mid: MethodId) {
        if let Some(inst) = self.instance(mid) {
            inst.borrow_mut().reset();
        }
        self.host.method_mut(mid).jit_installed = false;
        debug!(method = ?mid, "restored original definition");
    }
}

/// Per-analysis oracle: ties callee queries to the engine and constant
/// references to the analyzed method.
struct AnalysisHandle<'j> {
    jit: &'j Jit,
    mid: MethodId,
}

impl MethodOracle for AnalysisHandle<'_> {
    fn host(&self) -> &HostModel {
        self.jit.host()
    }

    fn callee_summary(&self, candidate: Candidate) -> CalleeSummary {
        self.jit.callee_summary(candidate)
    }

    fn record_constant_referrer(&self, name: Id) {
        self.jit
            .recompilation
            .borrow_mut()
            .add_constant_referrer(name, self.mid);
    }
}
