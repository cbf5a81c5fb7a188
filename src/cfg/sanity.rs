//! Structural consistency checker.
//!
//! Verifies the invariants the optimization passes rely on: dense indices,
//! terminator discipline, successor/backedge mirroring, definition-site
//! consistency and phi shape. Violations are compiler bugs, never a
//! consequence of host input, so the pipeline asserts on the result in
//! debug builds.

use super::opcode::OpcodeKind;
use super::{BlockId, ControlFlowGraph, OpcodeId, VarId};

const MAX_ERRORS: usize = 10;

pub struct CfgSanityChecker<'a> {
    cfg: &'a ControlFlowGraph,
    errors: Vec<String>,
    visited: Vec<bool>,
    work: Vec<BlockId>,
    current: BlockId,
}

impl<'a> CfgSanityChecker<'a> {
    pub fn new(cfg: &'a ControlFlowGraph) -> CfgSanityChecker<'a> {
        CfgSanityChecker {
            cfg,
            errors: Vec::new(),
            visited: vec![false; cfg.block_count()],
            work: Vec::new(),
            current: cfg.entry(),
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }

    fn error(&mut self, message: String) {
        self.errors
            .push(format!("block {}: {}", self.current, message));
    }

    fn opcode_error(&mut self, op: OpcodeId, message: String) {
        let mnemonic = self.cfg.opcode(op).mnemonic();
        self.errors.push(format!(
            "block {}: {}({:?}): {}",
            self.current, mnemonic, op, message
        ));
    }

    fn can_continue(&mut self) -> bool {
        if self.errors.len() >= MAX_ERRORS {
            self.errors
                .push("too many inconsistencies, aborted".to_string());
            return false;
        }
        true
    }

    fn add_block(&mut self, b: BlockId) {
        if !self.visited[b.index()] {
            self.work.push(b);
        }
    }

    pub fn check(&mut self) {
        self.check_indices();
        self.check_variables();
        if !self.errors.is_empty() {
            return;
        }

        self.work.push(self.cfg.entry());
        while let Some(b) = self.work.pop() {
            self.current = b;
            if !self.check_block(b) {
                return;
            }
        }

        for i in 0..self.visited.len() {
            if !self.visited[i] {
                self.current = BlockId(i as u32);
                self.error("referred to by no blocks".to_string());
            }
        }
    }

    fn check_indices(&mut self) {
        for (i, b) in self.cfg.block_ids().enumerate() {
            if self.cfg.block(b).index().index() != i {
                self.errors.push(format!(
                    "block {} stores index {:?}, inconsistent with its position",
                    i,
                    self.cfg.block(b).index()
                ));
            }
        }
        for (i, v) in self.cfg.var_ids().enumerate() {
            if self.cfg.variable(v).index().index() != i {
                self.errors.push(format!(
                    "variable {} stores index {:?}, inconsistent with its position",
                    i,
                    self.cfg.variable(v).index()
                ));
            }
        }
    }

    fn check_variables(&mut self) {
        for v in self.cfg.var_ids() {
            let var = self.cfg.variable(v);

            if var.is_env() {
                // An env must be produced by the env opcode, a call's
                // out-env, an env-to-env copy, or a phi over envs.
                if let Some(op) = var.def_opcode() {
                    match &self.cfg.opcode(op).kind {
                        OpcodeKind::Env { .. } | OpcodeKind::Phi { .. } => {}
                        OpcodeKind::Call { out_env, .. }
                        | OpcodeKind::Constant { out_env, .. } => {
                            if *out_env != v {
                                self.errors.push(format!(
                                    "env {} names def opcode {:?} whose out-env is {}",
                                    v, op, out_env
                                ));
                            }
                        }
                        OpcodeKind::Copy { rhs, .. } => {
                            if !self.cfg.variable(*rhs).is_env() {
                                self.errors.push(format!(
                                    "env {} is copied from {}, which is not an env",
                                    v, rhs
                                ));
                            }
                        }
                        other => {
                            self.errors.push(format!(
                                "env {} is defined by a {} opcode",
                                v,
                                other.mnemonic()
                            ));
                        }
                    }
                }
                continue;
            }

            let Some(op) = var.def_opcode() else {
                // Inputs and detached lookup results legitimately have no
                // defining opcode.
                continue;
            };
            let opc = self.cfg.opcode(op);
            if opc.lhs() != Some(v) && opc.out_env() != Some(v) {
                self.errors.push(format!(
                    "variable {} names def opcode {:?}, which defines neither it nor its env",
                    v, op
                ));
                continue;
            }
            if !self.cfg.block(var.def_block()).contains_opcode(op) {
                self.errors.push(format!(
                    "variable {} names def block {} which does not contain its def opcode {:?}",
                    v,
                    var.def_block(),
                    op
                ));
            }
        }
    }

    fn check_block(&mut self, b: BlockId) -> bool {
        self.visited[b.index()] = true;
        let block = self.cfg.block(b);

        if self.cfg.terminator_of(b).is_none() {
            self.error("last opcode is not a terminator".to_string());
        }

        // Backedge consistency: every backedge must correspond to a real
        // edge from the predecessor.
        for (i, &pred) in block.backedges().iter().enumerate() {
            if pred.index() >= self.cfg.block_count() {
                self.error(format!("backedge {} does not belong to the cfg", i));
            } else if !self.cfg.successors_of(pred).contains(&b) {
                self.error(format!(
                    "backedge {} refers to block {}, which has no edge here",
                    i, pred
                ));
            }
        }

        for &op in block.opcodes() {
            self.check_opcode(b, op);
        }

        self.can_continue()
    }

    fn check_opcode(&mut self, b: BlockId, op: OpcodeId) {
        let opc = self.cfg.opcode(op);

        // Operand membership.
        let mut bad_operands: Vec<VarId> = Vec::new();
        opc.kind.for_each_rhs(|v| {
            if v.index() >= self.cfg.variable_count() {
                bad_operands.push(v);
            }
        });
        for v in bad_operands {
            self.opcode_error(op, format!("rhs {} does not belong to the cfg", v));
        }
        if let Some(lhs) = opc.lhs() {
            if lhs.index() >= self.cfg.variable_count() {
                self.opcode_error(op, format!("lhs {} does not belong to the cfg", lhs));
            }
        }

        match &opc.kind {
            OpcodeKind::Jump { target } => {
                if !self.cfg.block(*target).contains_backedge(b) {
                    self.opcode_error(op, format!("target {} has no backedge here", target));
                }
                self.add_block(*target);
            }
            OpcodeKind::JumpIf {
                if_true, if_false, ..
            } => {
                for succ in [*if_true, *if_false] {
                    if !self.cfg.block(succ).contains_backedge(b) {
                        self.opcode_error(op, format!("successor {} has no backedge here", succ));
                    }
                    self.add_block(succ);
                }
            }
            OpcodeKind::Phi {
                operands, block, ..
            } => {
                if *block != b {
                    self.opcode_error(op, format!("phi claims to live in block {}", block));
                }
                let backedges = self.cfg.block(b).backedge_count();
                if operands.len() != backedges {
                    self.opcode_error(
                        op,
                        format!(
                            "{} operands but the block has {} backedges",
                            operands.len(),
                            backedges
                        ),
                    );
                }
                if operands.len() <= 1 {
                    self.opcode_error(
                        op,
                        format!("{} operands is too few for a phi", operands.len()),
                    );
                }
                // Operands of one phi must descend from the same source
                // variable and share its name reference.
                let undefined = self.cfg.undefined();
                for pair in operands.windows(2) {
                    let (a, b2) = (pair[0], pair[1]);
                    if a == undefined || b2 == undefined {
                        continue;
                    }
                    let va = self.cfg.variable(a);
                    let vb = self.cfg.variable(b2);
                    // Env identity is tracked through type constraints, and
                    // inlining joins envs from different methods; originals
                    // are only meaningful for same-method operands.
                    if va.is_env() || vb.is_env() {
                        continue;
                    }
                    if va.original() != a
                        && vb.original() != b2
                        && va.original() != vb.original()
                    {
                        self.opcode_error(
                            op,
                            format!("operands {} and {} descend from different originals", a, b2),
                        );
                    }
                    if va.name_ref() != vb.name_ref() {
                        self.opcode_error(
                            op,
                            format!("operands {} and {} have mismatched name references", a, b2),
                        );
                    }
                }
            }
            OpcodeKind::Hash { elems, .. } => {
                if elems.len() % 2 != 0 {
                    self.opcode_error(op, "odd number of hash operands".to_string());
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::opcode::Opcode;
    use crate::host::value::Value;

    fn terminated_pair() -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new();
        let entry = cfg.add_block(Some("entry"));
        let exit = cfg.add_block(Some("exit"));
        cfg.set_entry(entry);
        cfg.set_exit(exit);
        let nil = cfg.create_variable(None, None, entry, None);
        let op = cfg.append_opcode(
            entry,
            Opcode::new(OpcodeKind::Immediate {
                lhs: nil,
                value: Value::Nil,
            }),
        );
        cfg.variable_mut(nil).set_def_opcode(Some(op));
        cfg.set_undefined(nil);
        cfg.set_entry_env(nil);
        cfg.set_exit_env(nil);
        cfg.append_opcode(entry, Opcode::new(OpcodeKind::Jump { target: exit }));
        cfg.block_mut(exit).add_backedge(entry);
        cfg.append_opcode(exit, Opcode::new(OpcodeKind::Exit));
        cfg
    }

    #[test]
    fn test_clean_graph_passes() {
        let cfg = terminated_pair();
        assert!(cfg.check_sanity().is_empty(), "{:?}", cfg.check_sanity());
    }

    #[test]
    fn test_missing_backedge_is_reported() {
        let mut cfg = terminated_pair();
        let exit = cfg.exit();
        let entry = cfg.entry();
        cfg.block_mut(exit).remove_backedge(entry);
        let errors = cfg.check_sanity();
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| e.contains("no backedge")));
    }

    #[test]
    fn test_unterminated_block_is_reported() {
        let mut cfg = terminated_pair();
        let entry = cfg.entry();
        let last = cfg.block(entry).last_opcode().unwrap();
        cfg.remove_opcode(entry, last);
        let errors = cfg.check_sanity();
        assert!(errors.iter().any(|e| e.contains("not a terminator")));
    }
}
