//! Type-analysis scenarios driven directly through the pipeline pieces,
//! with a table oracle standing in for the engine.

mod common;

use common::*;
use ignition::analysis::{find_dominators, DomTree, SsaTranslator};
use ignition::build_method;
use ignition::cfg::{BlockId, ControlFlowGraph, OpcodeKind};
use ignition::host::{builtin, HostModel, Id, MethodBody, NativeKind, Node, Value};
use ignition::typing::{
    Boolean, CalleeSummary, MethodOracle, TypeAnalyzer, TypeConstraint,
};

fn ssa_pipeline(root: &Node, name: &str) -> ControlFlowGraph {
    let mut built = build_method(root, Id::intern(name)).expect("build");
    let idoms = find_dominators(&built.cfg);
    let tree = DomTree::build(&built.cfg, &idoms);
    built.cfg.set_dom_tree(tree.clone());
    SsaTranslator::new(&mut built.cfg, &mut built.def_info, tree, true).translate();
    assert!(built.cfg.check_sanity().is_empty());
    assert!(built.cfg.check_ssa().is_empty());
    built.cfg
}

fn block_named(cfg: &ControlFlowGraph, name: &str) -> BlockId {
    cfg.block_ids()
        .find(|&b| cfg.block(b).name() == Some(name))
        .unwrap_or_else(|| panic!("no block named {}", name))
}

/// `def f(x); x + 1; end` with `x : ExactClass(Fixnum)` resolves the
/// operator through Fixnum and types the output exactly.
#[test]
fn test_fixnum_plus_types_output_exactly() {
    init_tracing();

    let mut host = HostModel::new();
    let plus = host.define_method(
        builtin::FIXNUM,
        "+",
        1,
        MethodBody::Native {
            kind: NativeKind::Func,
            info: None,
        },
    );
    let oracle = TableOracle::new(host).with_summary(
        plus,
        CalleeSummary::Known {
            return_type: TypeConstraint::ExactClass(builtin::FIXNUM),
            mutator: false,
        },
    );

    let root = scope(&["x"], 1, call(lvar("x"), "+", vec![fixnum(1)]));
    let cfg = ssa_pipeline(&root, "f");

    let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
    analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
    analyzer.set_input_type(1, TypeConstraint::ExactClass(builtin::FIXNUM));
    let result = analyzer.analyze();

    let out = cfg.output().expect("method returns");
    assert_eq!(
        result.ctx.type_of(out),
        Some(&TypeConstraint::ExactClass(builtin::FIXNUM))
    );
    assert!(!result.mutator);
}

/// `def g(c); if c then 1 else 2 end; end` joins two constants.
#[test]
fn test_if_join_is_a_constant_selection() {
    init_tracing();

    let root = scope(
        &["c"],
        1,
        Node::If {
            cond: n(lvar("c")),
            then: Some(n(fixnum(1))),
            els: Some(n(fixnum(2))),
        },
    );
    let cfg = ssa_pipeline(&root, "g");
    let oracle = TableOracle::new(HostModel::new());

    let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
    analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
    let result = analyzer.analyze();

    let out = cfg.output().expect("method returns");
    let expected = TypeConstraint::Selection(vec![
        TypeConstraint::Constant(Value::Fixnum(1)),
        TypeConstraint::Constant(Value::Fixnum(2)),
    ]);
    assert_eq!(result.ctx.type_of(out), Some(&expected));

    // The join phi's operands are the two constants.
    let mut phi_operand_types = Vec::new();
    for b in cfg.block_ids() {
        for &op in cfg.block(b).opcodes() {
            if let OpcodeKind::Phi { operands, .. } = &cfg.opcode(op).kind {
                for &v in operands {
                    phi_operand_types.push(result.ctx.type_of(v).cloned().unwrap());
                }
            }
        }
    }
    assert_eq!(phi_operand_types.len(), 2);
    assert!(phi_operand_types
        .iter()
        .all(|t| matches!(t, TypeConstraint::Constant(Value::Fixnum(_)))));
}

/// `while true` never leaves the loop: the preexit path and everything
/// after it is unreachable, and the analyzer proves it.
#[test]
fn test_infinite_loop_reachability() {
    init_tracing();

    let root = scope(
        &[],
        0,
        Node::Seq(vec![
            n(Node::While {
                cond: n(Node::True),
                body: Some(n(Node::Nil)),
                pretest: true,
            }),
            n(Node::Nil),
        ]),
    );
    let cfg = ssa_pipeline(&root, "h");
    let oracle = TableOracle::new(HostModel::new());

    let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
    analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
    let result = analyzer.analyze();

    let preexit = block_named(&cfg, "while_preexit");
    let loop_exit = block_named(&cfg, "while_exit");
    let cond = block_named(&cfg, "while_cond");
    assert!(result.reachable_blocks[cond.index()]);
    assert!(!result.reachable_blocks[preexit.index()]);
    assert!(!result.reachable_blocks[loop_exit.index()]);
    assert!(!result.reachable_blocks[cfg.exit().index()]);
}

/// A terminating while's value is always nil.
#[test]
fn test_while_result_is_nil() {
    init_tracing();

    let root = scope(
        &["c"],
        1,
        Node::While {
            cond: n(lvar("c")),
            body: Some(n(Node::Nil)),
            pretest: true,
        },
    );
    let cfg = ssa_pipeline(&root, "spin");
    let oracle = TableOracle::new(HostModel::new());

    let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
    analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
    let result = analyzer.analyze();

    let out = cfg.output().expect("method returns");
    assert_eq!(
        result.ctx.type_of(out),
        Some(&TypeConstraint::Constant(Value::Nil))
    );
}

/// The analysis is a fixed point: running it twice produces identical
/// constraints for every variable.
#[test]
fn test_analysis_is_idempotent() {
    init_tracing();

    let root = scope(
        &["c"],
        1,
        Node::If {
            cond: n(lvar("c")),
            then: Some(n(fixnum(1))),
            els: Some(n(fixnum(2))),
        },
    );
    let cfg = ssa_pipeline(&root, "again");
    let oracle = TableOracle::new(HostModel::new());

    let run = || {
        let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
        analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
        analyzer.analyze()
    };
    let first = run();
    let second = run();

    for v in cfg.var_ids() {
        assert_eq!(
            first.ctx.type_of(v),
            second.ctx.type_of(v),
            "constraint of {:?} drifted between runs",
            v
        );
    }
}

/// Primitives fold type tests once the operand class is proved.
#[test]
fn test_class_test_primitive_folds() {
    init_tracing();

    let root = scope(
        &["x"],
        1,
        funcall("jit__is_fixnum", vec![lvar("x")]),
    );
    let cfg = ssa_pipeline(&root, "probe");
    let oracle = TableOracle::new(HostModel::new());

    let mut analyzer = TypeAnalyzer::new(&cfg, &oracle, vec![]);
    analyzer.set_input_type(0, TypeConstraint::ClassOrSubclass(builtin::OBJECT));
    analyzer.set_input_type(1, TypeConstraint::ExactClass(builtin::FIXNUM));
    let result = analyzer.analyze();

    let out = cfg.output().expect("method returns");
    assert_eq!(
        result.ctx.type_of(out),
        Some(&TypeConstraint::Constant(Value::Bool(true)))
    );
    assert!(result.jit_only, "primitive use marks the method jit-only");
    assert_eq!(
        result
            .ctx
            .type_of(out)
            .unwrap()
            .evaluates_to_boolean(&result.ctx, oracle.host()),
        Boolean::AlwaysTrue
    );
}
