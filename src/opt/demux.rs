//! Type-test demultiplexing.
//!
//! Splits a block at a polymorphic call site and emits a linear ladder of
//! class tests routing control into one empty segment per receiver class
//! (plus an `otherwise` tail when the class list is open), all converging
//! on a shared exit block. Phis for the call's result and out-env are
//! pre-allocated in the exit block with placeholder operands, positionally
//! paired with the backedges the caller wires in.

use smallvec::smallvec;

use crate::cfg::{BlockId, ControlFlowGraph, Opcode, OpcodeId, OpcodeKind, SourceLoc, VarId};
use crate::host::model::{builtin, ClassId};
use crate::host::primitives;
use crate::host::value::Value;
use crate::typing::constraint::TypeConstraint;
use crate::typing::context::TypeContext;

pub struct DemuxResult {
    pub exit_block: BlockId,
    /// One (empty, unterminated) block per case, the last being the
    /// fall-through arm.
    pub segments: Vec<BlockId>,
    pub phi: Option<OpcodeId>,
    pub env_phi: Option<OpcodeId>,
}

/// Split `block` at the call in position `call_pos` and build the ladder.
/// The call opcode is detached from the block but its arena slot survives
/// for the caller to consult.
pub fn demultiplex(
    cfg: &mut ControlFlowGraph,
    ctx: &mut TypeContext,
    block: BlockId,
    call_pos: usize,
    selector: VarId,
    cases: &[ClassId],
    otherwise: bool,
) -> DemuxResult {
    let call_id = cfg.block(block).opcodes()[call_pos];
    let loc = cfg.opcode(call_id).loc;

    let exit_block = cfg.split_block(block, call_pos, true);
    cfg.block_mut(exit_block).set_name("demux_exit");

    let mut segments = Vec::with_capacity(cases.len() + otherwise as usize);
    let mut cur = block;
    let count = cases.len() - 1 + otherwise as usize;
    for &case in cases.iter().take(count) {
        let cond = emit_type_test(cfg, ctx, cur, selector, case, loc);
        let segment = cfg.add_block(Some("demux_segment"));
        let next = cfg.add_block(Some("demux_cond"));
        cfg.append_opcode(
            cur,
            Opcode::with_loc(
                OpcodeKind::JumpIf {
                    cond,
                    if_true: segment,
                    if_false: next,
                },
                loc,
            ),
        );
        cfg.block_mut(segment).add_backedge(cur);
        cfg.block_mut(next).add_backedge(cur);
        segments.push(segment);
        cur = next;
    }
    segments.push(cur);

    // Placeholder phis; the caller overwrites operand i once backedge i
    // exists.
    let undefined = cfg.undefined();
    let env_phi = cfg.opcode(call_id).out_env().map(|out_env| {
        let id = cfg.insert_opcode(
            exit_block,
            0,
            Opcode::with_loc(
                OpcodeKind::Phi {
                    lhs: out_env,
                    operands: smallvec![undefined; count + 1],
                    block: exit_block,
                },
                loc,
            ),
        );
        cfg.variable_mut(out_env).set_def_site(exit_block, Some(id));
        id
    });
    let phi = cfg.opcode(call_id).lhs().map(|lhs| {
        let id = cfg.insert_opcode(
            exit_block,
            0,
            Opcode::with_loc(
                OpcodeKind::Phi {
                    lhs,
                    operands: smallvec![undefined; count + 1],
                    block: exit_block,
                },
                loc,
            ),
        );
        cfg.variable_mut(lhs).set_def_site(exit_block, Some(id));
        id
    });

    DemuxResult {
        exit_block,
        segments,
        phi,
        env_phi,
    }
}

/// Emit the test for one class. Built-in immediates get dedicated
/// predicates; everything else compares `class_of(selector)` against the
/// class object.
fn emit_type_test(
    cfg: &mut ControlFlowGraph,
    ctx: &mut TypeContext,
    block: BlockId,
    selector: VarId,
    case: ClassId,
    loc: Option<SourceLoc>,
) -> VarId {
    let cond = if case == builtin::TRUE_CLASS {
        emit_prim(cfg, block, primitives::is_true_name(), &[selector], loc)
    } else if case == builtin::FALSE_CLASS {
        emit_prim(cfg, block, primitives::is_false_name(), &[selector], loc)
    } else if case == builtin::NIL_CLASS {
        emit_prim(cfg, block, primitives::is_nil_name(), &[selector], loc)
    } else if case == builtin::FIXNUM {
        emit_prim(cfg, block, primitives::is_fixnum_name(), &[selector], loc)
    } else {
        let class_obj = emit_value(
            cfg,
            block,
            |lhs| OpcodeKind::Immediate {
                lhs,
                value: Value::Class(case),
            },
            loc,
        );
        let selector_class = emit_prim(
            cfg,
            block,
            primitives::class_of_name(),
            &[selector],
            loc,
        );
        ctx.fit_size(cfg);
        ctx.set(class_obj, TypeConstraint::Constant(Value::Class(case)));
        ctx.set(selector_class, TypeConstraint::Any);
        emit_prim(
            cfg,
            block,
            primitives::bitwise_compare_eq_name(),
            &[class_obj, selector_class],
            loc,
        )
    };

    // Typed as the true/false selection so later analysis can fold the
    // test once a case is proved.
    ctx.fit_size(cfg);
    ctx.set(
        cond,
        TypeConstraint::Selection(vec![
            TypeConstraint::ExactClass(builtin::TRUE_CLASS),
            TypeConstraint::ExactClass(builtin::FALSE_CLASS),
        ]),
    );
    cond
}

fn emit_prim(
    cfg: &mut ControlFlowGraph,
    block: BlockId,
    name: crate::host::ids::Id,
    args: &[VarId],
    loc: Option<SourceLoc>,
) -> VarId {
    emit_value(
        cfg,
        block,
        |lhs| OpcodeKind::Primitive {
            lhs: Some(lhs),
            name,
            args: crate::cfg::opcode::Operands::from_slice(args),
        },
        loc,
    )
}

fn emit_value(
    cfg: &mut ControlFlowGraph,
    block: BlockId,
    make: impl FnOnce(VarId) -> OpcodeKind,
    loc: Option<SourceLoc>,
) -> VarId {
    let lhs = cfg.create_variable(None, None, block, None);
    let op = cfg.append_opcode(block, Opcode::with_loc(make(lhs), loc));
    cfg.variable_mut(lhs).set_def_opcode(Some(op));
    lhs
}
