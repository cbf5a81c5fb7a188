//! Type constraints and the abstract-interpretation analyzer.

pub mod analyzer;
pub mod constraint;
pub mod context;

pub use analyzer::{
    AnalysisResult, CalleeSummary, MethodOracle, Reachability, TypeAnalyzer,
};
pub use constraint::{
    Boolean, Candidate, Lattice, LookupConstraint, TypeConstraint, TypeList, TypeSelection,
    MAX_CANDIDATE_COUNT,
};
pub use context::TypeContext;
