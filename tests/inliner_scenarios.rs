//! End-to-end compilation scenarios: inlining, demultiplexing, recursion
//! and invalidation, all driven through the engine.

mod common;

use common::*;
use ignition::cfg::{ControlFlowGraph, OpcodeKind};
use ignition::host::{builtin, HostModel, Id, MethodBody, Node, Value};
use ignition::jit::Jit;
use ignition::typing::TypeConstraint;

fn count_kind(cfg: &ControlFlowGraph, pred: impl Fn(&OpcodeKind) -> bool) -> usize {
    let mut count = 0;
    for b in cfg.block_ids() {
        for &op in cfg.block(b).opcodes() {
            if pred(&cfg.opcode(op).kind) {
                count += 1;
            }
        }
    }
    count
}

/// `2 + 1` against an AST-defined `Fixnum#+` built from primitives: the
/// call site is monomorphic, gets inlined, and the whole method becomes a
/// primitive-only (jit-only) body with an exact return type.
#[test]
fn test_monomorphic_call_is_inlined() {
    init_tracing();

    let mut host = HostModel::new();
    // def +(other); jit__typecast_fixnum(jit__bitwise_add(self, other)); end
    let plus_body = scope(
        &["other"],
        1,
        funcall(
            "jit__typecast_fixnum",
            vec![funcall(
                "jit__bitwise_add",
                vec![Node::SelfRef, lvar("other")],
            )],
        ),
    );
    host.define_method(builtin::FIXNUM, "+", 1, MethodBody::Ast(n(plus_body)));

    // def calc; 2 + 1; end
    let calc_body = scope(&[], 0, call(fixnum(2), "+", vec![fixnum(1)]));
    let calc = host.define_method(builtin::OBJECT, "calc", 0, MethodBody::Ast(n(calc_body)));

    let mut jit = Jit::new(host);
    jit.compile(calc).unwrap();

    let inst = jit.instance(calc).unwrap();
    let inst = inst.borrow();
    let cfg = inst.cfg_ref().unwrap();

    // The call disappeared; the callee's primitives took its place.
    assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Call { .. })), 0);
    assert!(count_kind(cfg, |k| matches!(k, OpcodeKind::Primitive { .. })) >= 2);
    assert_eq!(
        inst.return_type_ref(),
        Some(&TypeConstraint::ExactClass(builtin::FIXNUM))
    );
    assert!(inst.is_jit_only());
    assert!(!inst.is_mutator());
    assert!(jit.host().method(calc).jit_installed);

    // The inlined callee is recorded for invalidation.
    assert!(jit
        .recompilation_manager()
        .callers_of(Id::intern("+"))
        .map(|callers| callers.contains(&calc))
        .unwrap_or(false));
}

/// Two-candidate polymorphic call: the inliner emits a type-test ladder
/// with one segment per class and joins the inlined bodies with a phi.
#[test]
fn test_polymorphic_call_is_demultiplexed() {
    init_tracing();

    let mut host = HostModel::new();
    let a = host.define_class("A", Some(builtin::OBJECT));
    let b = host.define_class("B", Some(builtin::OBJECT));
    host.define_method(a, "m", 0, MethodBody::Ast(n(scope(&[], 0, fixnum(1)))));
    host.define_method(b, "m", 0, MethodBody::Ast(n(scope(&[], 0, fixnum(2)))));

    // def poly(o); o.m; end
    let poly_body = scope(&["o"], 1, call(lvar("o"), "m", vec![]));
    let poly = host.define_method(builtin::OBJECT, "poly", 1, MethodBody::Ast(n(poly_body)));

    let mut jit = Jit::new(host);
    jit.compile_with_inputs(
        poly,
        &[(
            1,
            TypeConstraint::Selection(vec![
                TypeConstraint::ExactClass(a),
                TypeConstraint::ExactClass(b),
            ]),
        )],
    )
    .unwrap();

    let inst = jit.instance(poly).unwrap();
    let inst = inst.borrow();
    let cfg = inst.cfg_ref().unwrap();
    let ctx = inst.type_context_ref().unwrap();

    // No calls survive: both arms were inlined behind the type test.
    assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Call { .. })), 0);

    // The join phi merges both callees' outputs.
    let exit_block = cfg
        .block_ids()
        .find(|&blk| cfg.block(blk).name() == Some("demux_exit"))
        .expect("demux exit exists");
    let mut phi_seen = false;
    for &op in cfg.block(exit_block).opcodes() {
        if let OpcodeKind::Phi { operands, .. } = &cfg.opcode(op).kind {
            if operands
                .iter()
                .all(|&v| matches!(ctx.type_of(v), Some(TypeConstraint::Constant(_))))
            {
                phi_seen = true;
                assert_eq!(operands.len(), 2);
            }
        }
    }
    assert!(phi_seen, "result phi with constant operands expected");

    let expected = TypeConstraint::Selection(vec![
        TypeConstraint::Constant(Value::Fixnum(1)),
        TypeConstraint::Constant(Value::Fixnum(2)),
    ]);
    assert_eq!(inst.return_type_ref(), Some(&expected));
}

/// Self-recursion terminates through the fixpoint guard and is never
/// inlined into itself.
#[test]
fn test_recursive_method_terminates_and_keeps_its_call() {
    init_tracing();

    let mut host = HostModel::new();
    let math = host.define_class("MathBox", Some(builtin::OBJECT));
    // def fact(n); if jit__is_fixnum(n) then 1 else fact(n) end; end
    let fact_body = scope(
        &["n"],
        1,
        Node::If {
            cond: n(funcall("jit__is_fixnum", vec![lvar("n")])),
            then: Some(n(fixnum(1))),
            els: Some(n(funcall("fact", vec![lvar("n")]))),
        },
    );
    let fact = host.define_method(math, "fact", 1, MethodBody::Ast(n(fact_body)));

    let mut jit = Jit::new(host);
    jit.compile(fact).unwrap();

    let inst = jit.instance(fact).unwrap();
    let inst = inst.borrow();
    let cfg = inst.cfg_ref().unwrap();

    // The self-call must survive: direct recursion never inlines.
    assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Call { .. })), 1);

    // The return type joins the base case with the recursion guard.
    match inst.return_type_ref().unwrap() {
        TypeConstraint::Selection(items) => {
            assert!(items
                .iter()
                .any(|t| matches!(t, TypeConstraint::Constant(Value::Fixnum(1)))));
            assert!(items
                .iter()
                .any(|t| matches!(t, TypeConstraint::Recursion(m) if *m == fact)));
        }
        other => panic!("unexpected return type {:?}", other),
    }
}

/// Assignment chains collapse through copy folding: no phi appears and
/// the returned value traces straight back to the parameter.
#[test]
fn test_assignment_chain_folds_to_parameter() {
    init_tracing();

    let mut host = HostModel::new();
    // def chain(x); a = x; b = a; b; end
    let body = scope(
        &["x", "a", "b"],
        1,
        Node::Seq(vec![
            n(Node::LocalAssign(Id::intern("a"), n(lvar("x")))),
            n(Node::LocalAssign(Id::intern("b"), n(lvar("a")))),
            n(lvar("b")),
        ]),
    );
    let chain = host.define_method(builtin::OBJECT, "chain", 1, MethodBody::Ast(n(body)));

    let mut jit = Jit::new(host);
    jit.compile(chain).unwrap();

    let inst = jit.instance(chain).unwrap();
    let inst = inst.borrow();
    let cfg = inst.cfg_ref().unwrap();

    assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Phi { .. })), 0);

    // The output is copied directly from the parameter.
    let out = cfg.output().unwrap();
    let def = cfg.variable(out).def_opcode().unwrap();
    match &cfg.opcode(def).kind {
        OpcodeKind::Copy { rhs, .. } => {
            assert_eq!(*rhs, cfg.inputs()[1], "output should come from x");
        }
        other => panic!("output defined by {:?}", other.mnemonic()),
    }
}

/// Redefining an inlined callee restores the caller's pre-inlining
/// snapshot and uninstalls its JIT definition.
#[test]
fn test_callee_redefinition_invalidates_caller() {
    init_tracing();

    let mut host = HostModel::new();
    let calc_class = host.define_class("Calc", Some(builtin::OBJECT));
    // def double(x); jit__bitwise_add(x, x); end
    let double_body = scope(
        &["x"],
        1,
        funcall("jit__bitwise_add", vec![lvar("x"), lvar("x")]),
    );
    host.define_method(calc_class, "double", 1, MethodBody::Ast(n(double_body)));

    // def run_it(c); c.double(2); end
    let runner_body = scope(&["c"], 1, call(lvar("c"), "double", vec![fixnum(2)]));
    let runner = host.define_method(builtin::OBJECT, "run_it", 1, MethodBody::Ast(n(runner_body)));

    let mut jit = Jit::new(host);
    jit.compile_with_inputs(runner, &[(1, TypeConstraint::ExactClass(calc_class))])
        .unwrap();

    {
        let inst = jit.instance(runner).unwrap();
        let inst = inst.borrow();
        let cfg = inst.cfg_ref().unwrap();
        assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Call { .. })), 0);
        assert!(count_kind(cfg, |k| matches!(k, OpcodeKind::Primitive { .. })) >= 1);
        assert!(inst.original_cfg_ref().is_some());
    }
    assert!(jit.host().method(runner).jit_installed);

    // Host redefines Calc#double.
    jit.notify_method_redefined(Id::intern("double"));

    let inst = jit.instance(runner).unwrap();
    let inst = inst.borrow();
    let cfg = inst.cfg_ref().unwrap();
    // Back to the snapshot: the call is a call again, nothing inlined.
    assert_eq!(count_kind(cfg, |k| matches!(k, OpcodeKind::Call { .. })), 1);
    assert_eq!(
        count_kind(cfg, |k| matches!(k, OpcodeKind::Primitive { .. })),
        0
    );
    assert!(inst.return_type_ref().is_none());
    assert!(!jit.host().method(runner).jit_installed);
    assert!(jit
        .recompilation_manager()
        .callers_of(Id::intern("double"))
        .is_none());
}

/// Compiling a method that reads a constant records the reference, and a
/// constant redefinition invalidates the referrer.
#[test]
fn test_constant_redefinition_invalidates_referrer() {
    init_tracing();

    let mut host = HostModel::new();
    host.define_constant(builtin::OBJECT, "LIMIT", Value::Fixnum(10));
    // def limit; LIMIT; end
    let body = scope(&[], 0, Node::Const(Id::intern("LIMIT")));
    let limit = host.define_method(builtin::OBJECT, "limit", 0, MethodBody::Ast(n(body)));

    let mut jit = Jit::new(host);
    jit.compile(limit).unwrap();

    {
        let inst = jit.instance(limit).unwrap();
        let inst = inst.borrow();
        assert_eq!(
            inst.return_type_ref(),
            Some(&TypeConstraint::Constant(Value::Fixnum(10)))
        );
    }
    assert!(jit
        .recompilation_manager()
        .referrers_of(Id::intern("LIMIT"))
        .map(|r| r.contains(&limit))
        .unwrap_or(false));

    jit.notify_constant_redefined(Id::intern("LIMIT"));
    let inst = jit.instance(limit).unwrap();
    assert!(inst.borrow().return_type_ref().is_none());
    assert!(!jit.host().method(limit).jit_installed);
}
