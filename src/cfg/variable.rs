//! SSA values and pre-SSA definition tracking.

use std::collections::HashMap;

use smallvec::SmallVec;

use super::scope::NamedVarId;
use super::{BlockId, OpcodeId, VarId};
use crate::host::ids::Id;

/// A value in the CFG.
///
/// Before SSA translation a variable may have many definition sites (tracked
/// out-of-line in [`DefInfoMap`]); afterwards `def_block`/`def_opcode` name
/// its unique definition. `original` points at the pre-rename ancestor and
/// is used to check phi operand consistency.
#[derive(Debug, Clone)]
pub struct Variable {
    index: VarId,
    name: Option<Id>,
    name_ref: Option<NamedVarId>,
    def_block: BlockId,
    def_opcode: Option<OpcodeId>,
    original: VarId,
}

impl Variable {
    pub fn new(
        index: VarId,
        name: Option<Id>,
        name_ref: Option<NamedVarId>,
        def_block: BlockId,
        def_opcode: Option<OpcodeId>,
        original: VarId,
    ) -> Variable {
        Variable {
            index,
            name,
            name_ref,
            def_block,
            def_opcode,
            original,
        }
    }

    pub fn index(&self) -> VarId {
        self.index
    }

    pub fn set_index(&mut self, index: VarId) {
        self.index = index;
    }

    pub fn name(&self) -> Option<Id> {
        self.name
    }

    pub fn set_name(&mut self, name: Option<Id>) {
        self.name = name;
    }

    pub fn name_ref(&self) -> Option<NamedVarId> {
        self.name_ref
    }

    pub fn set_name_ref(&mut self, name_ref: Option<NamedVarId>) {
        self.name_ref = name_ref;
    }

    pub fn def_block(&self) -> BlockId {
        self.def_block
    }

    pub fn set_def_block(&mut self, block: BlockId) {
        self.def_block = block;
    }

    pub fn def_opcode(&self) -> Option<OpcodeId> {
        self.def_opcode
    }

    pub fn set_def_opcode(&mut self, op: Option<OpcodeId>) {
        self.def_opcode = op;
    }

    pub fn set_def_site(&mut self, block: BlockId, op: Option<OpcodeId>) {
        self.def_block = block;
        self.def_opcode = op;
    }

    /// The pre-rename ancestor; equals `index` for variables that were
    /// never renamed.
    pub fn original(&self) -> VarId {
        self.original
    }

    pub fn set_original(&mut self, original: VarId) {
        self.original = original;
    }

    /// True for the method-resolution environment and its renamed copies.
    pub fn is_env(&self) -> bool {
        self.name == Some(crate::host::ids::env_name())
    }
}

// ============================================================================
// DefInfo
// ============================================================================

/// Pre-SSA definition summary for one variable.
#[derive(Debug, Clone)]
pub struct DefInfo {
    def_blocks: SmallVec<[BlockId; 2]>,
    def_count: u32,
    local: bool,
}

impl DefInfo {
    pub fn new(def_block: BlockId) -> DefInfo {
        DefInfo {
            def_blocks: SmallVec::from_slice(&[def_block]),
            def_count: 1,
            local: true,
        }
    }

    /// Distinct blocks containing a definition.
    pub fn def_blocks(&self) -> &[BlockId] {
        &self.def_blocks
    }

    /// Total number of definitions, counting repeats within a block.
    pub fn def_count(&self) -> u32 {
        self.def_count
    }

    pub fn increase_def_count(&mut self) {
        self.def_count += 1;
    }

    pub fn decrease_def_count(&mut self) {
        debug_assert!(self.def_count > 0);
        self.def_count -= 1;
    }

    /// True while every definition and use sits in one block; such
    /// variables skip phi insertion entirely.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn set_local(&mut self, local: bool) {
        self.local = local;
    }

    pub fn add_def_site(&mut self, block: BlockId) {
        self.def_count += 1;
        if !self.def_blocks.contains(&block) {
            self.def_blocks.push(block);
        }
        if self.def_count > 1 {
            self.local = false;
        }
    }
}

/// Definition-site map for the whole CFG, maintained by the builder and
/// consumed (then discarded) by the SSA translator.
#[derive(Debug, Clone, Default)]
pub struct DefInfoMap {
    map: HashMap<VarId, DefInfo>,
}

impl DefInfoMap {
    pub fn new() -> DefInfoMap {
        DefInfoMap::default()
    }

    pub fn find(&self, v: VarId) -> Option<&DefInfo> {
        self.map.get(&v)
    }

    pub fn find_mut(&mut self, v: VarId) -> Option<&mut DefInfo> {
        self.map.get_mut(&v)
    }

    pub fn def_count(&self, v: VarId) -> u32 {
        self.map.get(&v).map_or(0, |d| d.def_count())
    }

    pub fn is_local(&self, v: VarId) -> bool {
        self.map.get(&v).map_or(true, |d| d.is_local())
    }

    pub fn set_local(&mut self, v: VarId, local: bool) {
        self.map
            .entry(v)
            .or_insert_with(|| DefInfo {
                def_blocks: SmallVec::new(),
                def_count: 0,
                local,
            })
            .set_local(local);
    }

    /// Record a definition of `v` at (`block`, `op`) and update the
    /// variable's def-site fields.
    pub fn update_def_site(&mut self, var: &mut Variable, block: BlockId, op: Option<OpcodeId>) {
        var.set_def_site(block, op);
        match self.map.get_mut(&var.index()) {
            Some(info) => info.add_def_site(block),
            None => {
                self.map.insert(var.index(), DefInfo::new(block));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_def_info_locality() {
        let mut info = DefInfo::new(BlockId(0));
        assert!(info.is_local());
        assert_eq!(info.def_count(), 1);

        // A second def, even in the same block, makes renaming necessary.
        info.add_def_site(BlockId(0));
        assert_eq!(info.def_count(), 2);
        assert!(!info.is_local());
        assert_eq!(info.def_blocks(), &[BlockId(0)]);

        info.add_def_site(BlockId(2));
        assert_eq!(info.def_blocks(), &[BlockId(0), BlockId(2)]);
    }
}
