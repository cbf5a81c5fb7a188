//! Host interpreter contract.
//!
//! Everything the compiler needs from the interpreter it serves: interned
//! identifiers, object values, the AST of a method body, class/method
//! reflection, and the primitive catalogue. The compiler core never walks
//! host memory directly; this module is the entire surface.

pub mod ast;
pub mod ids;
pub mod model;
pub mod primitives;
pub mod value;

pub use ast::{ArgsInfo, Node, NodeRef, StrPart};
pub use ids::Id;
pub use model::{
    builtin, ClassId, ConstantLookup, HostModel, MethodBody, MethodDef, MethodId, MutatorTester,
    NativeInfo, NativeKind,
};
pub use primitives::{global_primitive_store, Primitive, PrimitiveStore};
pub use value::Value;
