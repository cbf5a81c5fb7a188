//! SSA translation: phi insertion over dominance frontiers, then variable
//! renaming with copy folding.

use smallvec::smallvec;
use tracing::{debug, trace};

use super::domtree::DomTree;
use crate::cfg::{
    BlockId, ControlFlowGraph, DefInfoMap, Opcode, OpcodeId, OpcodeKind, VarId,
};

pub struct SsaTranslator<'a> {
    cfg: &'a mut ControlFlowGraph,
    def_info: &'a mut DefInfoMap,
    dom_tree: DomTree,
    do_copy_folding: bool,

    /// Dominance frontier, `df[b][x]` true when x is in DF(b).
    df: Vec<Vec<bool>>,

    // Working state for phi insertion.
    phi_inserted: Vec<Option<VarId>>,
    processed: Vec<Option<VarId>>,

    // Working state for renaming.
    rename_stack: Vec<Vec<VarId>>,
    folded: Vec<VarId>,
}

impl<'a> SsaTranslator<'a> {
    pub fn new(
        cfg: &'a mut ControlFlowGraph,
        def_info: &'a mut DefInfoMap,
        dom_tree: DomTree,
        do_copy_folding: bool,
    ) -> SsaTranslator<'a> {
        let blocks = cfg.block_count();
        let vars = cfg.variable_count();
        SsaTranslator {
            cfg,
            def_info,
            dom_tree,
            do_copy_folding,
            df: vec![vec![false; blocks]; blocks],
            phi_inserted: vec![None; blocks],
            processed: vec![None; blocks],
            rename_stack: vec![Vec::new(); vars],
            folded: Vec::new(),
        }
    }

    pub fn translate(mut self) {
        self.compute_df();
        self.insert_phi_functions();
        self.rename_variables();
        debug!(
            blocks = self.cfg.block_count(),
            variables = self.cfg.variable_count(),
            folded = self.folded.len(),
            "ssa translation done"
        );
    }

    // ------------------------------------------------------------------
    // Dominance frontier
    // ------------------------------------------------------------------

    fn compute_df(&mut self) {
        for b in self.cfg.block_ids() {
            if b == self.cfg.entry() {
                continue;
            }
            if self.cfg.block(b).backedge_count() < 2 {
                continue;
            }
            let base = self.dom_tree.idom(b);
            for i in 0..self.cfg.block(b).backedge_count() {
                let mut runner = Some(self.cfg.block(b).backedges()[i]);
                while runner != base {
                    let r = runner.expect("frontier walk escaped the entry");
                    self.df[r.index()][b.index()] = true;
                    runner = self.dom_tree.idom(r);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Phi insertion
    // ------------------------------------------------------------------

    fn insert_phi_functions(&mut self) {
        for v in 0..self.cfg.variable_count() as u32 {
            let v = VarId(v);
            let Some(info) = self.def_info.find(v) else {
                continue;
            };
            if info.is_local() && info.def_blocks().len() == 1 {
                // Every def and use sits in one block; no phi can be needed.
                continue;
            }
            let def_blocks: Vec<BlockId> = info.def_blocks().to_vec();
            for &b in &def_blocks {
                self.processed[b.index()] = Some(v);
            }
            for &b in &def_blocks {
                self.insert_phis_for_def_site(b.index(), v);
            }
        }
    }

    fn insert_phis_for_def_site(&mut self, block_index: usize, v: VarId) {
        for i in 0..self.cfg.block_count() {
            if !self.df[block_index][i] {
                continue;
            }
            if self.phi_inserted[i] != Some(v) {
                self.insert_single_phi(BlockId(i as u32), v);
                self.phi_inserted[i] = Some(v);
            }
            // The phi is itself a definition of v.
            if self.processed[i] != Some(v) {
                self.processed[i] = Some(v);
                self.insert_phis_for_def_site(i, v);
            }
        }
    }

    fn insert_single_phi(&mut self, b: BlockId, v: VarId) {
        let size = self.cfg.block(b).backedge_count();
        debug_assert!(size > 0, "phi in a block without predecessors");
        trace!(block = ?b, var = ?v, operands = size, "insert phi");

        self.cfg.insert_opcode(
            b,
            0,
            Opcode::new(OpcodeKind::Phi {
                lhs: v,
                operands: smallvec![v; size],
                block: b,
            }),
        );
        self.def_info
            .find_mut(v)
            .expect("phi inserted for untracked variable")
            .increase_def_count();
    }

    // ------------------------------------------------------------------
    // Renaming
    // ------------------------------------------------------------------

    fn rename_variables(&mut self) {
        for &input in &self.cfg.inputs().to_vec() {
            self.rename_stack[input.index()].push(input);
        }

        self.rename_block(self.cfg.entry());

        let folded = std::mem::take(&mut self.folded);
        self.cfg.remove_variables(&folded);
        self.folded = folded;

        // The inputs have no defining opcode, so renaming never updated
        // their def sites; pin them to the entry block.
        let entry = self.cfg.entry();
        for input in self.cfg.inputs().to_vec() {
            self.cfg.variable_mut(input).set_def_site(entry, None);
        }
    }

    fn rename_block(&mut self, b: BlockId) {
        let var_size = self.rename_stack.len();
        let depths: Vec<usize> = self.rename_stack.iter().map(|s| s.len()).collect();

        let mut i = 0;
        while i < self.cfg.block(b).opcode_count() {
            let opid = self.cfg.block(b).opcodes()[i];

            // Rewrite rhs operands to their current names. Phi operands
            // are renamed from the predecessor side instead.
            if !self.cfg.opcode(opid).kind.is_phi() {
                let undefined = self.cfg.undefined();
                let rename_stack = &self.rename_stack;
                self.cfg.opcode_mut(opid).kind.for_each_rhs_mut(|v| {
                    *v = rename_stack[v.index()]
                        .last()
                        .copied()
                        .unwrap_or(undefined);
                });
            }

            if let Some(lhs) = self.cfg.opcode(opid).lhs() {
                if self.try_fold_copy(b, i, opid, lhs) {
                    // The copy is gone; the same index now holds the next
                    // opcode.
                    continue;
                }
                self.rename_lhs(b, opid, lhs);
            }
            if let Some(env) = self.cfg.opcode(opid).out_env() {
                self.rename_out_env(b, opid, env);
            }

            i += 1;
        }

        // Rename the matching phi operand in each successor.
        for succ in self.cfg.successors_of(b) {
            self.rename_phi_operands(b, succ);
        }

        // Recurse into dominator-tree children.
        for child in self.dom_tree.children(b) {
            self.rename_block(child);
        }

        // Unwind names pushed while processing this subtree.
        for idx in 0..var_size {
            self.rename_stack[idx].truncate(depths[idx]);
        }
    }

    /// Copy folding. A copy is deleted when its lhs is not the output, not
    /// an env, and either both sides reference the same named variable, or
    /// the lhs has a single definition and both sides are named locals
    /// (assignment chains). The folded lhs's uses resolve to the rhs's
    /// current name instead.
    fn try_fold_copy(&mut self, b: BlockId, at: usize, opid: OpcodeId, lhs: VarId) -> bool {
        if !self.do_copy_folding {
            return false;
        }
        let rhs = match &self.cfg.opcode(opid).kind {
            OpcodeKind::Copy { rhs, .. } => *rhs,
            _ => return false,
        };
        if Some(lhs) == self.cfg.output() || self.cfg.variable(lhs).is_env() {
            return false;
        }

        let lhs_ref = self.cfg.variable(lhs).name_ref();
        let rhs_ref = self.cfg.variable(rhs).name_ref();
        let same_name = lhs_ref == rhs_ref;
        let single_def_alias =
            lhs_ref.is_some() && rhs_ref.is_some() && self.def_info.def_count(lhs) == 1;
        if !(same_name || single_def_alias) {
            return false;
        }

        trace!(block = ?b, ?lhs, ?rhs, "fold copy");
        self.rename_stack[lhs.index()].push(rhs);
        let info = self
            .def_info
            .find_mut(lhs)
            .expect("folded variable has no def info");
        if info.def_count() == 1 {
            self.folded.push(lhs);
        } else {
            info.decrease_def_count();
        }
        self.cfg.block_mut(b).remove_opcode_at(at);
        true
    }

    fn rename_lhs(&mut self, b: BlockId, opid: OpcodeId, lhs: VarId) {
        if self.def_info.def_count(lhs) > 1 {
            let temp = self.cfg.copy_variable(b, Some(opid), lhs);
            self.def_info
                .find_mut(lhs)
                .expect("multiply-defined variable has no def info")
                .decrease_def_count();
            self.rename_stack[lhs.index()].push(temp);
            if self.cfg.variable(lhs).is_env() {
                if b == self.cfg.entry() {
                    self.cfg.set_entry_env(temp);
                } else if b == self.cfg.exit() {
                    self.cfg.set_exit_env(temp);
                }
            }
            self.cfg.opcode_mut(opid).set_lhs(temp);
            self.rename_stack.push(Vec::new());
        } else {
            self.rename_stack[lhs.index()].push(lhs);
            // Phi lhs def sites in particular must be updated here.
            self.cfg.variable_mut(lhs).set_def_site(b, Some(opid));
        }
    }

    fn rename_out_env(&mut self, b: BlockId, opid: OpcodeId, env: VarId) {
        if self.def_info.def_count(env) > 1 {
            let temp = self.cfg.copy_variable(b, Some(opid), env);
            self.def_info
                .find_mut(env)
                .expect("multiply-defined env has no def info")
                .decrease_def_count();
            self.rename_stack[env.index()].push(temp);
            self.cfg.opcode_mut(opid).set_out_env(temp);
            self.rename_stack.push(Vec::new());
        } else {
            self.rename_stack[env.index()].push(env);
            self.cfg.variable_mut(env).set_def_site(b, Some(opid));
        }
    }

    fn rename_phi_operands(&mut self, parent: BlockId, b: BlockId) {
        let Some(pos) = self.cfg.block(b).backedge_index_of(parent) else {
            return;
        };
        let ops: Vec<OpcodeId> = self.cfg.block(b).opcodes().to_vec();
        for opid in ops {
            let undefined = self.cfg.undefined();
            let rename_stack = &self.rename_stack;
            match &mut self.cfg.opcode_mut(opid).kind {
                OpcodeKind::Phi { operands, .. } => {
                    let current = operands[pos];
                    operands[pos] = rename_stack[current.index()]
                        .last()
                        .copied()
                        .unwrap_or(undefined);
                }
                // Phis sit at the front of the block.
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dominators::find_dominators;
    use crate::builder::build_method;
    use crate::host::ast::{ArgsInfo, Node};
    use crate::host::ids::Id;
    use crate::host::value::Value;
    use std::rc::Rc;

    fn translate(root: &Node, name: &str) -> ControlFlowGraph {
        let mut built = build_method(root, Id::intern(name)).expect("build");
        let idoms = find_dominators(&built.cfg);
        let tree = DomTree::build(&built.cfg, &idoms);
        built.cfg.set_dom_tree(tree.clone());
        SsaTranslator::new(&mut built.cfg, &mut built.def_info, tree, true).translate();
        assert!(built.cfg.check_sanity().is_empty(), "{:?}", built.cfg.check_sanity());
        assert!(built.cfg.check_ssa().is_empty(), "{:?}", built.cfg.check_ssa());
        built.cfg
    }

    fn scope(locals: &[&str], body: Node) -> Node {
        Node::Scope {
            locals: locals.iter().map(|n| Id::intern(n)).collect(),
            args: ArgsInfo::required(0),
            body: Rc::new(body),
        }
    }

    #[test]
    fn test_straight_line_has_no_phis() {
        let root = scope(
            &["a"],
            Node::Seq(vec![
                Rc::new(Node::LocalAssign(
                    Id::intern("a"),
                    Rc::new(Node::Literal(Value::Fixnum(1))),
                )),
                Rc::new(Node::LocalVar(Id::intern("a"))),
            ]),
        );
        let cfg = translate(&root, "straight");
        for b in cfg.block_ids() {
            for &op in cfg.block(b).opcodes() {
                assert!(!cfg.opcode(op).kind.is_phi());
            }
        }
    }

    #[test]
    fn test_if_join_gets_phi_with_positional_operands() {
        // a = if c then 1 else 2 end; a
        let root = scope(
            &["c", "a"],
            Node::Seq(vec![
                Rc::new(Node::LocalAssign(
                    Id::intern("a"),
                    Rc::new(Node::If {
                        cond: Rc::new(Node::LocalVar(Id::intern("c"))),
                        then: Some(Rc::new(Node::Literal(Value::Fixnum(1)))),
                        els: Some(Rc::new(Node::Literal(Value::Fixnum(2)))),
                    }),
                )),
                Rc::new(Node::LocalVar(Id::intern("a"))),
            ]),
        );
        let cfg = translate(&root, "join");

        let mut phi_count = 0;
        for b in cfg.block_ids() {
            for &op in cfg.block(b).opcodes() {
                if let OpcodeKind::Phi {
                    operands, block, ..
                } = &cfg.opcode(op).kind
                {
                    phi_count += 1;
                    assert_eq!(*block, b);
                    assert_eq!(operands.len(), cfg.block(b).backedge_count());
                }
            }
        }
        assert!(phi_count >= 1, "join point should carry a phi");
    }

    #[test]
    fn test_copy_folding_collapses_assignment_chain() {
        // a = x-like chain built from temporaries: a = 1; b = a; b
        let root = scope(
            &["a", "b"],
            Node::Seq(vec![
                Rc::new(Node::LocalAssign(
                    Id::intern("a"),
                    Rc::new(Node::Literal(Value::Fixnum(1))),
                )),
                Rc::new(Node::LocalAssign(
                    Id::intern("b"),
                    Rc::new(Node::LocalVar(Id::intern("a"))),
                )),
                Rc::new(Node::LocalVar(Id::intern("b"))),
            ]),
        );
        let cfg = translate(&root, "chain");

        // No phi is created and at most the output copy survives: every
        // non-output copy was folded.
        for b in cfg.block_ids() {
            for &op in cfg.block(b).opcodes() {
                match &cfg.opcode(op).kind {
                    OpcodeKind::Phi { .. } => panic!("unexpected phi"),
                    OpcodeKind::Copy { lhs, .. } => {
                        let is_output = Some(*lhs) == cfg.output();
                        let is_env = cfg.variable(*lhs).is_env();
                        assert!(is_output || is_env, "unfolded copy survived");
                    }
                    _ => {}
                }
            }
        }
    }
}
