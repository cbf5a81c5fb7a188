//! Def-use chains.
//!
//! For every variable, the list of (block, opcode) sites that read it and
//! produce a value. The type analyzer uses the chains to re-evaluate exactly
//! the expressions affected by a type change, in O(uses) per change.

use crate::cfg::{BlockId, ControlFlowGraph, OpcodeId, VarId};

#[derive(Debug, Clone)]
pub struct DefUseChain {
    uses: Vec<Vec<(BlockId, OpcodeId)>>,
    conditions: Vec<bool>,
}

impl DefUseChain {
    pub fn build(cfg: &ControlFlowGraph) -> DefUseChain {
        let mut chain = DefUseChain {
            uses: vec![Vec::new(); cfg.variable_count()],
            conditions: vec![false; cfg.variable_count()],
        };

        for b in cfg.block_ids() {
            for &opid in cfg.block(b).opcodes() {
                let op = cfg.opcode(opid);
                if let crate::cfg::OpcodeKind::JumpIf { cond, .. } = &op.kind {
                    chain.conditions[cond.index()] = true;
                    continue;
                }
                // Only value-producing opcodes are re-run from the chain.
                if op.lhs().is_none() && op.out_env().is_none() {
                    continue;
                }
                op.kind.for_each_rhs(|v| {
                    chain.uses[v.index()].push((b, opid));
                });
            }
        }

        chain
    }

    pub fn uses(&self, v: VarId) -> &[(BlockId, OpcodeId)] {
        &self.uses[v.index()]
    }

    /// True when the variable feeds a conditional branch.
    pub fn is_condition(&self, v: VarId) -> bool {
        self.conditions[v.index()]
    }
}
