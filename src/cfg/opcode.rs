//! Typed instructions with uniform operand access.
//!
//! Opcodes are a tagged sum. Two traversal surfaces are provided:
//!
//! - generic lhs/rhs/out-env/successor accessors, used by the SSA
//!   translator, the duplicator and the checkers;
//! - [`OpcodeVisitor`], a per-variant dispatch trait that is the seam a
//!   native code generator plugs into.

use std::rc::Rc;

use smallvec::SmallVec;

use super::{BlockId, VarId};
use crate::host::ast::NodeRef;
use crate::host::ids::Id;
use crate::host::model::{ClassId, MethodId};
use crate::host::value::Value;

/// Source position, when the host supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
}

/// Operand list storage; nearly all opcodes have four or fewer operands.
pub type Operands = SmallVec<[VarId; 4]>;

/// A single instruction.
#[derive(Debug, Clone)]
pub struct Opcode {
    pub loc: Option<SourceLoc>,
    pub kind: OpcodeKind,
}

/// The instruction variants.
#[derive(Debug, Clone)]
pub enum OpcodeKind {
    Copy {
        lhs: VarId,
        rhs: VarId,
    },
    Jump {
        target: BlockId,
    },
    JumpIf {
        cond: VarId,
        if_true: BlockId,
        if_false: BlockId,
    },
    Immediate {
        lhs: VarId,
        value: Value,
    },
    /// Produces the method-resolution environment token.
    Env {
        lhs: VarId,
    },
    /// Method resolution for `receiver.name`, valid under `env`.
    Lookup {
        lhs: VarId,
        receiver: VarId,
        name: Id,
        env: VarId,
        /// Pre-resolved target installed by the inliner's specialized
        /// call sites; `None` for an open lookup.
        entry: Option<(ClassId, MethodId)>,
    },
    /// Call through a lookup result. `operands` is
    /// `[receiver, args.., lookup]`; `out_env` is written, not read.
    Call {
        lhs: Option<VarId>,
        operands: Operands,
        code_block: Option<VarId>,
        out_env: VarId,
    },
    /// A block literal passed to a call; carried opaquely.
    CodeBlock {
        lhs: VarId,
        body: NodeRef,
    },
    /// Constant reference. `toplevel` forces resolution from the root;
    /// otherwise a nil `base` means cref-chain resolution.
    Constant {
        lhs: Option<VarId>,
        name: Id,
        base: VarId,
        toplevel: bool,
        in_env: VarId,
        out_env: VarId,
    },
    Primitive {
        lhs: Option<VarId>,
        name: Id,
        args: Operands,
    },
    /// Join; operand `i` pairs with backedge `i` of `block`.
    Phi {
        lhs: VarId,
        operands: Operands,
        block: BlockId,
    },
    Exit,
    Array {
        lhs: Option<VarId>,
        elems: Operands,
    },
    Range {
        lhs: Option<VarId>,
        low: VarId,
        high: VarId,
        exclusive: bool,
    },
    String {
        lhs: VarId,
        value: Rc<str>,
    },
    /// Flat key/value operand list; length is always even.
    Hash {
        lhs: Option<VarId>,
        elems: Operands,
    },
    /// Marks entry into the method's lexical scope.
    Enter,
    /// Marks departure from the method's lexical scope.
    Leave,
    /// Argument-count check placeholder for variadic entry sequences.
    CheckArg,
}

impl Opcode {
    pub fn new(kind: OpcodeKind) -> Opcode {
        Opcode { loc: None, kind }
    }

    pub fn with_loc(kind: OpcodeKind, loc: Option<SourceLoc>) -> Opcode {
        Opcode { loc, kind }
    }

    pub fn lhs(&self) -> Option<VarId> {
        self.kind.lhs()
    }

    pub fn set_lhs(&mut self, v: VarId) {
        self.kind.set_lhs(v)
    }

    pub fn out_env(&self) -> Option<VarId> {
        self.kind.out_env()
    }

    pub fn set_out_env(&mut self, v: VarId) {
        self.kind.set_out_env(v)
    }

    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        self.kind.successors()
    }

    pub fn mnemonic(&self) -> &'static str {
        self.kind.mnemonic()
    }
}

impl OpcodeKind {
    pub fn lhs(&self) -> Option<VarId> {
        match self {
            OpcodeKind::Copy { lhs, .. }
            | OpcodeKind::Immediate { lhs, .. }
            | OpcodeKind::Env { lhs }
            | OpcodeKind::Lookup { lhs, .. }
            | OpcodeKind::CodeBlock { lhs, .. }
            | OpcodeKind::Phi { lhs, .. }
            | OpcodeKind::String { lhs, .. } => Some(*lhs),
            OpcodeKind::Call { lhs, .. }
            | OpcodeKind::Constant { lhs, .. }
            | OpcodeKind::Primitive { lhs, .. }
            | OpcodeKind::Array { lhs, .. }
            | OpcodeKind::Range { lhs, .. }
            | OpcodeKind::Hash { lhs, .. } => *lhs,
            OpcodeKind::Jump { .. }
            | OpcodeKind::JumpIf { .. }
            | OpcodeKind::Exit
            | OpcodeKind::Enter
            | OpcodeKind::Leave
            | OpcodeKind::CheckArg => None,
        }
    }

    pub fn set_lhs(&mut self, v: VarId) {
        match self {
            OpcodeKind::Copy { lhs, .. }
            | OpcodeKind::Immediate { lhs, .. }
            | OpcodeKind::Env { lhs }
            | OpcodeKind::Lookup { lhs, .. }
            | OpcodeKind::CodeBlock { lhs, .. }
            | OpcodeKind::Phi { lhs, .. }
            | OpcodeKind::String { lhs, .. } => *lhs = v,
            OpcodeKind::Call { lhs, .. }
            | OpcodeKind::Constant { lhs, .. }
            | OpcodeKind::Primitive { lhs, .. }
            | OpcodeKind::Array { lhs, .. }
            | OpcodeKind::Range { lhs, .. }
            | OpcodeKind::Hash { lhs, .. } => *lhs = Some(v),
            _ => debug_assert!(false, "opcode {} has no lhs", self.mnemonic()),
        }
    }

    /// The value written behind the lhs: the environment after a call or
    /// constant reference completes.
    pub fn out_env(&self) -> Option<VarId> {
        match self {
            OpcodeKind::Call { out_env, .. } | OpcodeKind::Constant { out_env, .. } => {
                Some(*out_env)
            }
            _ => None,
        }
    }

    pub fn set_out_env(&mut self, v: VarId) {
        match self {
            OpcodeKind::Call { out_env, .. } | OpcodeKind::Constant { out_env, .. } => *out_env = v,
            _ => debug_assert!(false, "opcode {} has no out-env", self.mnemonic()),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpcodeKind::Jump { .. } | OpcodeKind::JumpIf { .. } | OpcodeKind::Exit
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, OpcodeKind::Phi { .. })
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            OpcodeKind::Jump { target } => SmallVec::from_slice(&[*target]),
            OpcodeKind::JumpIf {
                if_true, if_false, ..
            } => SmallVec::from_slice(&[*if_true, *if_false]),
            _ => SmallVec::new(),
        }
    }

    pub fn for_each_successor_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            OpcodeKind::Jump { target } => f(target),
            OpcodeKind::JumpIf {
                if_true, if_false, ..
            } => {
                f(if_true);
                f(if_false);
            }
            _ => {}
        }
    }

    /// Visit every read operand. Phi operands are included; callers that
    /// treat phis specially (the SSA renamer) must skip phis themselves.
    pub fn for_each_rhs(&self, mut f: impl FnMut(VarId)) {
        match self {
            OpcodeKind::Copy { rhs, .. } => f(*rhs),
            OpcodeKind::JumpIf { cond, .. } => f(*cond),
            OpcodeKind::Lookup { receiver, env, .. } => {
                f(*receiver);
                f(*env);
            }
            OpcodeKind::Call {
                operands,
                code_block,
                ..
            } => {
                for v in operands {
                    f(*v);
                }
                if let Some(cb) = code_block {
                    f(*cb);
                }
            }
            OpcodeKind::Constant { base, in_env, .. } => {
                f(*base);
                f(*in_env);
            }
            OpcodeKind::Primitive { args, .. } => {
                for v in args {
                    f(*v);
                }
            }
            OpcodeKind::Phi { operands, .. } => {
                for v in operands {
                    f(*v);
                }
            }
            OpcodeKind::Array { elems, .. } | OpcodeKind::Hash { elems, .. } => {
                for v in elems {
                    f(*v);
                }
            }
            OpcodeKind::Range { low, high, .. } => {
                f(*low);
                f(*high);
            }
            _ => {}
        }
    }

    /// Mutable counterpart of [`Self::for_each_rhs`].
    pub fn for_each_rhs_mut(&mut self, mut f: impl FnMut(&mut VarId)) {
        match self {
            OpcodeKind::Copy { rhs, .. } => f(rhs),
            OpcodeKind::JumpIf { cond, .. } => f(cond),
            OpcodeKind::Lookup { receiver, env, .. } => {
                f(receiver);
                f(env);
            }
            OpcodeKind::Call {
                operands,
                code_block,
                ..
            } => {
                for v in operands.iter_mut() {
                    f(v);
                }
                if let Some(cb) = code_block {
                    f(cb);
                }
            }
            OpcodeKind::Constant { base, in_env, .. } => {
                f(base);
                f(in_env);
            }
            OpcodeKind::Primitive { args, .. } => {
                for v in args.iter_mut() {
                    f(v);
                }
            }
            OpcodeKind::Phi { operands, .. } => {
                for v in operands.iter_mut() {
                    f(v);
                }
            }
            OpcodeKind::Array { elems, .. } | OpcodeKind::Hash { elems, .. } => {
                for v in elems.iter_mut() {
                    f(v);
                }
            }
            OpcodeKind::Range { low, high, .. } => {
                f(low);
                f(high);
            }
            _ => {}
        }
    }

    pub fn rhs_vars(&self) -> Operands {
        let mut out = Operands::new();
        self.for_each_rhs(|v| out.push(v));
        out
    }

    /// Rewrite every variable and block reference through the given maps.
    /// Used by the code duplicator.
    pub fn remap(&mut self, var_map: impl Fn(VarId) -> VarId, block_map: impl Fn(BlockId) -> BlockId) {
        if let Some(lhs) = self.lhs() {
            self.set_lhs(var_map(lhs));
        }
        if let Some(env) = self.out_env() {
            self.set_out_env(var_map(env));
        }
        self.for_each_rhs_mut(|v| *v = var_map(*v));
        self.for_each_successor_mut(|b| *b = block_map(*b));
        if let OpcodeKind::Phi { block, .. } = self {
            *block = block_map(*block);
        }
    }

    // ------------------------------------------------------------------
    // Call helpers
    // ------------------------------------------------------------------

    /// Receiver of a call (first operand).
    pub fn call_receiver(&self) -> VarId {
        match self {
            OpcodeKind::Call { operands, .. } => operands[0],
            _ => unreachable!("not a call"),
        }
    }

    /// Receiver plus user arguments (everything but the lookup).
    pub fn call_receiver_and_args(&self) -> &[VarId] {
        match self {
            OpcodeKind::Call { operands, .. } => &operands[..operands.len() - 1],
            _ => unreachable!("not a call"),
        }
    }

    /// The lookup operand (last).
    pub fn call_lookup(&self) -> VarId {
        match self {
            OpcodeKind::Call { operands, .. } => operands[operands.len() - 1],
            _ => unreachable!("not a call"),
        }
    }

    pub fn set_call_lookup(&mut self, v: VarId) {
        match self {
            OpcodeKind::Call { operands, .. } => {
                let last = operands.len() - 1;
                operands[last] = v;
            }
            _ => unreachable!("not a call"),
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpcodeKind::Copy { .. } => "copy",
            OpcodeKind::Jump { .. } => "jump",
            OpcodeKind::JumpIf { .. } => "jumpif",
            OpcodeKind::Immediate { .. } => "imm",
            OpcodeKind::Env { .. } => "env",
            OpcodeKind::Lookup { .. } => "lookup",
            OpcodeKind::Call { .. } => "call",
            OpcodeKind::CodeBlock { .. } => "codeblock",
            OpcodeKind::Constant { .. } => "const",
            OpcodeKind::Primitive { .. } => "prim",
            OpcodeKind::Phi { .. } => "phi",
            OpcodeKind::Exit => "exit",
            OpcodeKind::Array { .. } => "array",
            OpcodeKind::Range { .. } => "range",
            OpcodeKind::String { .. } => "string",
            OpcodeKind::Hash { .. } => "hash",
            OpcodeKind::Enter => "enter",
            OpcodeKind::Leave => "leave",
            OpcodeKind::CheckArg => "checkarg",
        }
    }
}

// ============================================================================
// Visitor
// ============================================================================

/// Per-variant dispatch over opcodes. This is the surface a code generator
/// implements; every method defaults to "continue".
///
/// Returning `false` stops the traversal driven by
/// [`crate::cfg::ControlFlowGraph::visit_block_opcodes`].
#[allow(unused_variables)]
pub trait OpcodeVisitor {
    fn visit_copy(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_jump(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_jump_if(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_immediate(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_env(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_lookup(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_call(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_code_block(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_constant(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_primitive(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_phi(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_exit(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_array(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_range(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_string(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_hash(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_enter(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_leave(&mut self, op: &Opcode) -> bool {
        true
    }
    fn visit_check_arg(&mut self, op: &Opcode) -> bool {
        true
    }
}

/// Dispatch one opcode to the matching visitor method.
pub fn dispatch_opcode<V: OpcodeVisitor + ?Sized>(visitor: &mut V, op: &Opcode) -> bool {
    match &op.kind {
        OpcodeKind::Copy { .. } => visitor.visit_copy(op),
        OpcodeKind::Jump { .. } => visitor.visit_jump(op),
        OpcodeKind::JumpIf { .. } => visitor.visit_jump_if(op),
        OpcodeKind::Immediate { .. } => visitor.visit_immediate(op),
        OpcodeKind::Env { .. } => visitor.visit_env(op),
        OpcodeKind::Lookup { .. } => visitor.visit_lookup(op),
        OpcodeKind::Call { .. } => visitor.visit_call(op),
        OpcodeKind::CodeBlock { .. } => visitor.visit_code_block(op),
        OpcodeKind::Constant { .. } => visitor.visit_constant(op),
        OpcodeKind::Primitive { .. } => visitor.visit_primitive(op),
        OpcodeKind::Phi { .. } => visitor.visit_phi(op),
        OpcodeKind::Exit => visitor.visit_exit(op),
        OpcodeKind::Array { .. } => visitor.visit_array(op),
        OpcodeKind::Range { .. } => visitor.visit_range(op),
        OpcodeKind::String { .. } => visitor.visit_string(op),
        OpcodeKind::Hash { .. } => visitor.visit_hash(op),
        OpcodeKind::Enter => visitor.visit_enter(op),
        OpcodeKind::Leave => visitor.visit_leave(op),
        OpcodeKind::CheckArg => visitor.visit_check_arg(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_operand_layout() {
        let call = OpcodeKind::Call {
            lhs: Some(VarId(9)),
            operands: Operands::from_slice(&[VarId(0), VarId(1), VarId(2), VarId(3)]),
            code_block: None,
            out_env: VarId(8),
        };
        assert_eq!(call.call_receiver(), VarId(0));
        assert_eq!(call.call_receiver_and_args(), &[VarId(0), VarId(1), VarId(2)]);
        assert_eq!(call.call_lookup(), VarId(3));
    }

    #[test]
    fn test_rhs_traversal_covers_out_of_line_operands() {
        let call = OpcodeKind::Call {
            lhs: None,
            operands: Operands::from_slice(&[VarId(0), VarId(1)]),
            code_block: Some(VarId(5)),
            out_env: VarId(8),
        };
        let rhs = call.rhs_vars();
        assert_eq!(rhs.as_slice(), &[VarId(0), VarId(1), VarId(5)]);
        // out_env is a definition, not a read
        assert!(!rhs.contains(&VarId(8)));
    }

    #[test]
    fn test_terminators() {
        assert!(OpcodeKind::Exit.is_terminator());
        assert!(OpcodeKind::Jump { target: BlockId(0) }.is_terminator());
        assert!(!OpcodeKind::Enter.is_terminator());
        assert_eq!(
            OpcodeKind::JumpIf {
                cond: VarId(0),
                if_true: BlockId(1),
                if_false: BlockId(2)
            }
            .successors()
            .as_slice(),
            &[BlockId(1), BlockId(2)]
        );
    }

    #[test]
    fn test_remap_offsets_every_reference() {
        let mut phi = OpcodeKind::Phi {
            lhs: VarId(1),
            operands: Operands::from_slice(&[VarId(2), VarId(3)]),
            block: BlockId(4),
        };
        phi.remap(|v| VarId(v.0 + 10), |b| BlockId(b.0 + 20));
        match phi {
            OpcodeKind::Phi {
                lhs,
                operands,
                block,
            } => {
                assert_eq!(lhs, VarId(11));
                assert_eq!(operands.as_slice(), &[VarId(12), VarId(13)]);
                assert_eq!(block, BlockId(24));
            }
            _ => unreachable!(),
        }
    }
}
