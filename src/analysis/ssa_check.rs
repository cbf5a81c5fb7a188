//! SSA well-formedness checker.
//!
//! Walks the dominator tree once with an accumulating defined-set and
//! verifies that every variable is defined exactly once, every non-phi use
//! is preceded by its definition, and every phi operand is defined along
//! its incoming edge.

use std::collections::HashSet;

use super::dominators::find_dominators;
use super::domtree::DomTree;
use crate::cfg::{BlockId, ControlFlowGraph, OpcodeKind, VarId};

pub fn check_ssa(cfg: &ControlFlowGraph) -> Vec<String> {
    let idoms = find_dominators(cfg);
    let tree = DomTree::build(cfg, &idoms);

    let mut errors = Vec::new();
    let mut defined: HashSet<VarId> = cfg.inputs().iter().copied().collect();

    let mut work = vec![cfg.entry()];
    while let Some(b) = work.pop() {
        check_block(cfg, b, &mut defined, &mut errors);
        work.extend(tree.children(b));
    }

    errors
}

fn check_block(
    cfg: &ControlFlowGraph,
    b: BlockId,
    defined: &mut HashSet<VarId>,
    errors: &mut Vec<String>,
) {
    for &opid in cfg.block(b).opcodes() {
        let op = cfg.opcode(opid);

        if !op.kind.is_phi() {
            op.kind.for_each_rhs(|v| {
                if !defined.contains(&v) {
                    errors.push(format!(
                        "use of {} in block {} ({}) is not dominated by its definition",
                        v,
                        b,
                        op.mnemonic()
                    ));
                }
            });
        }

        if let Some(lhs) = op.lhs() {
            if !defined.insert(lhs) {
                errors.push(format!(
                    "{} in block {} ({}) is defined twice",
                    lhs,
                    b,
                    op.mnemonic()
                ));
            }
        }
        if let Some(env) = op.out_env() {
            if !defined.insert(env) {
                errors.push(format!(
                    "env {} in block {} ({}) is defined twice",
                    env,
                    b,
                    op.mnemonic()
                ));
            }
        }
    }

    for succ in cfg.successors_of(b) {
        check_phis_of_successor(cfg, b, succ, defined, errors);
    }
}

fn check_phis_of_successor(
    cfg: &ControlFlowGraph,
    b: BlockId,
    succ: BlockId,
    defined: &HashSet<VarId>,
    errors: &mut Vec<String>,
) {
    let Some(index) = cfg.block(succ).backedge_index_of(b) else {
        return;
    };
    for &opid in cfg.block(succ).opcodes() {
        match &cfg.opcode(opid).kind {
            OpcodeKind::Phi { operands, .. } => {
                if let Some(&v) = operands.get(index) {
                    if !defined.contains(&v) {
                        errors.push(format!(
                            "operand {} of the phi at block {} (edge {} -> {}) is not dominated by its definition",
                            v, succ, b, succ
                        ));
                    }
                }
            }
            _ => break,
        }
    }
}
