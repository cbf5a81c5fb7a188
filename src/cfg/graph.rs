//! The control-flow graph arena.

use smallvec::SmallVec;

use super::block::Block;
use super::opcode::{dispatch_opcode, Opcode, OpcodeKind, OpcodeVisitor};
use super::scope::NamedVarId;
use super::variable::Variable;
use super::{BlockId, OpcodeId, VarId};
use crate::analysis::domtree::DomTree;
use crate::host::ids::Id;

/// Single-entry single-exit control-flow graph.
///
/// Owns its blocks, opcodes and variables in stable-indexed vectors.
/// Distinguished slots: `entry`, `exit`, `output` (the exit value),
/// `undefined` (sentinel substituted for uses without a reaching
/// definition), and the `entry_env`/`exit_env` tokens threading the
/// method-resolution environment.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    blocks: Vec<Block>,
    opcodes: Vec<Opcode>,
    variables: Vec<Variable>,

    inputs: Vec<VarId>,
    required_argc: usize,
    has_optional_arg: bool,
    has_rest_arg: bool,

    entry: BlockId,
    exit: BlockId,
    output: Option<VarId>,
    undefined: VarId,
    entry_env: VarId,
    exit_env: VarId,

    dom_tree: Option<DomTree>,
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId(u32::MAX)
    }
}

impl Default for VarId {
    fn default() -> Self {
        VarId(u32::MAX)
    }
}

impl ControlFlowGraph {
    pub fn new() -> ControlFlowGraph {
        ControlFlowGraph::default()
    }

    // ------------------------------------------------------------------
    // Distinguished slots
    // ------------------------------------------------------------------

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn set_entry(&mut self, b: BlockId) {
        self.entry = b;
    }

    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn set_exit(&mut self, b: BlockId) {
        self.exit = b;
    }

    /// The method's return value; `None` until the first return path is
    /// built (a method that never returns keeps it `None`).
    pub fn output(&self) -> Option<VarId> {
        self.output
    }

    pub fn set_output(&mut self, v: VarId) {
        self.output = Some(v);
    }

    pub fn undefined(&self) -> VarId {
        self.undefined
    }

    pub fn set_undefined(&mut self, v: VarId) {
        self.undefined = v;
    }

    /// The environment at method entry. When two environments are proved
    /// equal, two lookups with the same receiver class and name resolve to
    /// the same method entry.
    pub fn entry_env(&self) -> VarId {
        self.entry_env
    }

    pub fn set_entry_env(&mut self, v: VarId) {
        self.entry_env = v;
    }

    pub fn exit_env(&self) -> VarId {
        self.exit_env
    }

    pub fn set_exit_env(&mut self, v: VarId) {
        self.exit_env = v;
    }

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn add_input(&mut self, v: VarId) {
        self.inputs.push(v);
    }

    pub fn set_inputs(&mut self, inputs: Vec<VarId>) {
        self.inputs = inputs;
    }

    pub fn required_argc(&self) -> usize {
        self.required_argc
    }

    pub fn set_required_argc(&mut self, n: usize) {
        self.required_argc = n;
    }

    pub fn has_optional_arg(&self) -> bool {
        self.has_optional_arg
    }

    pub fn set_has_optional_arg(&mut self, b: bool) {
        self.has_optional_arg = b;
    }

    pub fn has_rest_arg(&self) -> bool {
        self.has_rest_arg
    }

    pub fn set_has_rest_arg(&mut self, b: bool) {
        self.has_rest_arg = b;
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn add_block(&mut self, name: Option<&'static str>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id, name));
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Successor blocks of `b`'s terminator (empty when the block is not
    /// yet terminated).
    pub fn successors_of(&self, b: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator_of(b) {
            Some(op) => self.opcode(op).successors(),
            None => SmallVec::new(),
        }
    }

    /// The block's terminator opcode, when its last opcode is one.
    pub fn terminator_of(&self, b: BlockId) -> Option<OpcodeId> {
        let last = self.block(b).last_opcode()?;
        self.opcode(last).is_terminator().then_some(last)
    }

    pub fn is_terminated(&self, b: BlockId) -> bool {
        self.terminator_of(b).is_some()
    }

    // ------------------------------------------------------------------
    // Opcodes
    // ------------------------------------------------------------------

    pub fn opcode(&self, id: OpcodeId) -> &Opcode {
        &self.opcodes[id.index()]
    }

    pub fn opcode_mut(&mut self, id: OpcodeId) -> &mut Opcode {
        &mut self.opcodes[id.index()]
    }

    /// Allocate an opcode slot without attaching it to a block.
    pub fn alloc_opcode(&mut self, op: Opcode) -> OpcodeId {
        let id = OpcodeId(self.opcodes.len() as u32);
        self.opcodes.push(op);
        id
    }

    /// Allocate and append an opcode to `b`.
    pub fn append_opcode(&mut self, b: BlockId, op: Opcode) -> OpcodeId {
        let id = self.alloc_opcode(op);
        self.block_mut(b).push_opcode(id);
        id
    }

    /// Allocate and insert an opcode at position `at` of `b`.
    pub fn insert_opcode(&mut self, b: BlockId, at: usize, op: Opcode) -> OpcodeId {
        let id = self.alloc_opcode(op);
        self.block_mut(b).insert_opcode(at, id);
        id
    }

    /// Detach an opcode from a block. The arena slot stays allocated but
    /// unreferenced.
    pub fn remove_opcode(&mut self, b: BlockId, op: OpcodeId) {
        self.block_mut(b).remove_opcode(op);
    }

    /// Dispatch every opcode of `b` to a visitor; stops early when a visit
    /// method returns `false`.
    pub fn visit_block_opcodes<V: OpcodeVisitor + ?Sized>(&self, b: BlockId, visitor: &mut V) -> bool {
        for &op in self.block(b).opcodes() {
            if !dispatch_opcode(visitor, self.opcode(op)) {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn variable_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.variables[id.index()]
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn var_ids(&self) -> impl Iterator<Item = VarId> {
        (0..self.variables.len() as u32).map(VarId)
    }

    pub fn contains_variable(&self, v: VarId) -> bool {
        v.index() < self.variables.len()
    }

    pub fn create_variable(
        &mut self,
        name: Option<Id>,
        name_ref: Option<NamedVarId>,
        def_block: BlockId,
        def_opcode: Option<OpcodeId>,
    ) -> VarId {
        let id = VarId(self.variables.len() as u32);
        self.variables
            .push(Variable::new(id, name, name_ref, def_block, def_opcode, id));
        id
    }

    /// Create a renamed copy of `source`, chaining `original` back to the
    /// pre-rename ancestor.
    pub fn copy_variable(
        &mut self,
        def_block: BlockId,
        def_opcode: Option<OpcodeId>,
        source: VarId,
    ) -> VarId {
        let (name, name_ref, original) = {
            let src = self.variable(source);
            (src.name(), src.name_ref(), src.original())
        };
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable::new(
            id, name, name_ref, def_block, def_opcode, original,
        ));
        id
    }

    /// Remove variables and compact indices. The removed variables must be
    /// unreferenced by any live opcode or distinguished slot.
    pub fn remove_variables(&mut self, remove: &[VarId]) {
        if remove.is_empty() {
            return;
        }
        let mut removed = vec![false; self.variables.len()];
        for &v in remove {
            removed[v.index()] = true;
        }

        let mut remap: Vec<Option<VarId>> = Vec::with_capacity(self.variables.len());
        let mut kept: Vec<Variable> = Vec::with_capacity(self.variables.len() - remove.len());
        for (i, var) in self.variables.drain(..).enumerate() {
            if removed[i] {
                remap.push(None);
            } else {
                let new_id = VarId(kept.len() as u32);
                remap.push(Some(new_id));
                let mut var = var;
                var.set_index(new_id);
                kept.push(var);
            }
        }

        let map = |v: VarId| -> VarId {
            remap[v.index()].expect("folded variable still referenced")
        };

        // Fix original chains; a kept variable's ancestor may have been
        // removed, in which case the variable becomes its own original.
        for var in &mut kept {
            let orig = var.original();
            match remap[orig.index()] {
                Some(new_orig) => var.set_original(new_orig),
                None => {
                    let own = var.index();
                    var.set_original(own);
                }
            }
        }
        self.variables = kept;

        // Rewrite live opcode references.
        for b in 0..self.blocks.len() {
            let ops: Vec<OpcodeId> = self.blocks[b].opcodes().to_vec();
            for op in ops {
                self.opcodes[op.index()].kind.remap(map, |b| b);
            }
        }

        let inputs: Vec<VarId> = self.inputs.iter().map(|&v| map(v)).collect();
        self.inputs = inputs;
        if let Some(out) = self.output {
            self.output = Some(map(out));
        }
        self.undefined = map(self.undefined);
        self.entry_env = map(self.entry_env);
        self.exit_env = map(self.exit_env);
    }

    // ------------------------------------------------------------------
    // Graph mutation
    // ------------------------------------------------------------------

    /// Split `b` after position `at`, moving the remaining opcodes into a
    /// fresh block. The opcode at `at` itself is dropped from `b` when
    /// `discard` is true, kept as `b`'s last opcode otherwise. The new
    /// block inherits `b`'s edge role: successors of the moved terminator
    /// repoint their backedges at the new block. `b` is left without a
    /// terminator; the caller wires it up.
    pub fn split_block(&mut self, b: BlockId, at: usize, discard: bool) -> BlockId {
        let new_id = self.add_block(Some("split"));

        let tail = self.block_mut(b).split_off_opcodes(at + 1);
        if discard {
            self.block_mut(b).remove_opcode_at(at);
        }

        // Move def sites of everything in the tail.
        for &op in &tail {
            let (lhs, out_env) = {
                let opc = self.opcode(op);
                (opc.lhs(), opc.out_env())
            };
            if let Some(v) = lhs {
                self.variable_mut(v).set_def_block(new_id);
            }
            if let Some(v) = out_env {
                self.variable_mut(v).set_def_block(new_id);
            }
            if let OpcodeKind::Phi { block, .. } = &mut self.opcodes[op.index()].kind {
                *block = new_id;
            }
        }

        // Successor backedges follow the moved terminator.
        if let Some(&last) = tail.last() {
            if self.opcode(last).is_terminator() {
                for succ in self.opcode(last).successors() {
                    self.block_mut(succ).update_backedge(b, new_id);
                }
            }
        }

        for op in tail {
            self.block_mut(new_id).push_opcode(op);
        }

        self.dom_tree = None;
        new_id
    }

    // ------------------------------------------------------------------
    // Dominator tree cache
    // ------------------------------------------------------------------

    pub fn dom_tree(&self) -> Option<&DomTree> {
        self.dom_tree.as_ref()
    }

    pub fn set_dom_tree(&mut self, tree: DomTree) {
        self.dom_tree = Some(tree);
    }

    pub fn invalidate_dom_tree(&mut self) {
        self.dom_tree = None;
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    /// Run the structural sanity checker, returning its findings.
    pub fn check_sanity(&self) -> Vec<String> {
        let mut checker = super::sanity::CfgSanityChecker::new(self);
        checker.check();
        checker.into_errors()
    }

    /// Run the SSA checker, returning its findings.
    pub fn check_ssa(&self) -> Vec<String> {
        crate::analysis::ssa_check::check_ssa(self)
    }
}
