//! Dominance analysis and SSA construction.

pub mod defuse;
pub mod dominators;
pub mod domtree;
pub mod ssa;
pub mod ssa_check;

pub use defuse::DefUseChain;
pub use dominators::{cooper_dominators, find_dominators};
pub use domtree::DomTree;
pub use ssa::SsaTranslator;
pub use ssa_check::check_ssa;
