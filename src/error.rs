//! Compilation error types.

/// Errors raised while turning a method body into an optimized CFG.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The AST contains a construct the CFG builder does not lower.
    ///
    /// The in-progress CFG is dropped; nothing leaks into the host's
    /// method table.
    UnsupportedSyntax {
        /// Name of the method being compiled
        method: String,
        /// Human-readable description of the offending construct
        detail: String,
    },
    /// `compile` was asked to process a method that has no AST body.
    MissingMethodBody {
        /// Name of the method
        method: String,
    },
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedSyntax { method, detail } => {
                write!(f, "unsupported syntax in {}: {}", method, detail)
            }
            Self::MissingMethodBody { method } => {
                write!(f, "method {} has no AST body to compile", method)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Result alias used throughout the compilation pipeline.
pub type CompileResult<T> = Result<T, CompileError>;
