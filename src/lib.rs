//! ignition - a method-level JIT compiler core
//!
//! This library is the middle end of a just-in-time compiler for a dynamic,
//! class-based object language. The host interpreter hands it one method's
//! AST at a time; it produces an optimized, SSA-form control-flow graph
//! annotated with inferred type constraints, ready for a code generator.
//!
//! # Architecture
//!
//! One method flows through the pipeline:
//!
//! 1. **CFG construction** (`builder`) - the AST is lowered into basic
//!    blocks with explicit control edges; short-circuit logicals and loops
//!    get their canonical shapes.
//! 2. **Dominance analysis** (`analysis`) - Lengauer-Tarjan immediate
//!    dominators (cross-checked against an independent iterative finder in
//!    debug builds) and the dominator tree.
//! 3. **SSA translation** (`analysis::ssa`) - phi insertion over dominance
//!    frontiers, renaming, and copy folding.
//! 4. **Type analysis** (`typing`) - a fixed-point abstract interpretation
//!    over a lattice of type constraints, with conditional edge
//!    reachability and callee summaries.
//! 5. **Inlining** (`opt`) - monomorphic call sites are replaced by the
//!    callee's duplicated body; polymorphic ones are demultiplexed through
//!    a type-test ladder. The analyzer then runs again over the result.
//!
//! The [`jit::Jit`] engine drives the pipeline, owns per-method state, and
//! reacts to host redefinition callbacks by restoring invalidated methods
//! (`recompile`).
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use ignition::host::{builtin, ArgsInfo, HostModel, MethodBody, Node};
//! use ignition::jit::Jit;
//!
//! // def answer; 42; end
//! let body = Node::Scope {
//!     locals: vec![],
//!     args: ArgsInfo::required(0),
//!     body: Rc::new(Node::Literal(ignition::host::Value::Fixnum(42))),
//! };
//! let mut host = HostModel::new();
//! let mid = host.define_method(builtin::OBJECT, "answer", 0, MethodBody::Ast(Rc::new(body)));
//!
//! let mut jit = Jit::new(host);
//! jit.compile(mid).unwrap();
//!
//! let instance = jit.instance(mid).unwrap();
//! let instance = instance.borrow();
//! assert!(instance.cfg_ref().is_some());
//! ```

pub mod analysis;
pub mod builder;
pub mod cfg;
pub mod error;
pub mod host;
pub mod jit;
pub mod opt;
pub mod recompile;
pub mod typing;

pub use builder::{build_method, BuildResult};
pub use error::{CompileError, CompileResult};
pub use jit::{CompilationInstance, Jit};
pub use recompile::RecompilationManager;
