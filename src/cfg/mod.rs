//! Control-flow-graph data model.
//!
//! Blocks, opcodes and variables live in index-addressed arenas owned by
//! [`ControlFlowGraph`]; every cross-reference is a plain integer id. This
//! keeps the graph free of ownership cycles and makes duplication a matter
//! of offsetting indices.

pub mod block;
pub mod graph;
pub mod opcode;
pub mod printer;
pub mod sanity;
pub mod scope;
pub mod variable;

use std::fmt;

pub use block::Block;
pub use graph::ControlFlowGraph;
pub use opcode::{dispatch_opcode, Opcode, OpcodeKind, OpcodeVisitor, SourceLoc};
pub use printer::CfgPrinter;
pub use sanity::CfgSanityChecker;
pub use scope::{NamedVarId, NamedVariable, Scope};
pub use variable::{DefInfo, DefInfoMap, Variable};

/// Index of a block within its CFG. Dense and equal to position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of a variable within its CFG. Dense and equal to position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// Slot of an opcode in the CFG's opcode arena. Slots are stable for the
/// lifetime of the graph; removing an opcode from a block leaves its slot
/// in place, unreferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpcodeId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OpcodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for OpcodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}
