//! CFG deep-copying.
//!
//! Blocks and variables are preallocated in the destination at a fixed
//! index offset from the source, so translating any reference is a single
//! addition. Used by the inliner to splice callee bodies into a caller and
//! by the engine to snapshot a method's pre-inlining graph.

use tracing::debug;

use crate::cfg::{BlockId, ControlFlowGraph, Opcode, OpcodeKind, VarId};
use crate::typing::constraint::TypeConstraint;
use crate::typing::context::TypeContext;

pub struct CodeDuplicator {
    block_offset: u32,
    var_offset: u32,
    src_entry: BlockId,
    src_exit: BlockId,
}

impl CodeDuplicator {
    /// Copy `src` into `dest`, translating type constraints into
    /// `dest_types`. No `Exit` opcode is emitted: the caller splices the
    /// body between a pre-split block and a fall-through, reattaching
    /// through [`Self::entry`] and [`Self::exit`].
    pub fn incorporate(
        src: &ControlFlowGraph,
        src_types: &TypeContext,
        dest: &mut ControlFlowGraph,
        dest_types: &mut TypeContext,
    ) -> CodeDuplicator {
        let dup = Self::copy_into(src, dest, false);

        dest_types.fit_size(dest);
        for v in src.var_ids() {
            let w = dup.var_of(v);
            let t = match src_types.type_of(v) {
                // Rebind aliases to the duplicated variable.
                Some(TypeConstraint::SameAs(x)) => TypeConstraint::SameAs(dup.var_of(*x)),
                Some(other) => other.clone(),
                None => TypeConstraint::Any,
            };
            dest_types.set(w, t);
        }

        debug!(
            blocks = src.block_count(),
            variables = src.variable_count(),
            "incorporated callee graph"
        );
        dup
    }

    /// Clone `src` into a fresh graph, `Exit` included and distinguished
    /// slots carried over. Used to snapshot the pre-inlining CFG.
    pub fn duplicate(src: &ControlFlowGraph) -> ControlFlowGraph {
        let mut dest = ControlFlowGraph::new();
        let dup = Self::copy_into(src, &mut dest, true);

        dest.set_entry(dup.block_of(src.entry()));
        dest.set_exit(dup.block_of(src.exit()));
        if let Some(out) = src.output() {
            dest.set_output(dup.var_of(out));
        }
        dest.set_undefined(dup.var_of(src.undefined()));
        dest.set_entry_env(dup.var_of(src.entry_env()));
        dest.set_exit_env(dup.var_of(src.exit_env()));
        dest.set_inputs(src.inputs().iter().map(|&v| dup.var_of(v)).collect());
        dest.set_required_argc(src.required_argc());
        dest.set_has_optional_arg(src.has_optional_arg());
        dest.set_has_rest_arg(src.has_rest_arg());
        if let Some(tree) = src.dom_tree() {
            // Offsets are zero in a fresh clone, so the links carry over.
            dest.set_dom_tree(tree.clone());
        }

        dest
    }

    fn copy_into(src: &ControlFlowGraph, dest: &mut ControlFlowGraph, emit_exit: bool) -> CodeDuplicator {
        let dup = CodeDuplicator {
            block_offset: dest.block_count() as u32,
            var_offset: dest.variable_count() as u32,
            src_entry: src.entry(),
            src_exit: src.exit(),
        };

        // Preallocate blocks and variables; from here on, translation is
        // pure index offsetting.
        for b in src.block_ids() {
            let new_b = dest.add_block(src.block(b).name());
            debug_assert_eq!(new_b, dup.block_of(b));
        }
        for v in src.var_ids() {
            let var = src.variable(v);
            let new_v = dest.create_variable(
                var.name(),
                var.name_ref(),
                dup.block_of(var.def_block()),
                None,
            );
            let orig = dup.var_of(var.original());
            dest.variable_mut(new_v).set_original(orig);
            debug_assert_eq!(new_v, dup.var_of(v));
        }

        for b in src.block_ids() {
            let new_b = dup.block_of(b);
            for &opid in src.block(b).opcodes() {
                let op = src.opcode(opid);
                if matches!(op.kind, OpcodeKind::Exit) && !emit_exit {
                    continue;
                }
                let mut kind = op.kind.clone();
                kind.remap(|v| dup.var_of(v), |blk| dup.block_of(blk));
                let new_id = dest.append_opcode(new_b, Opcode::with_loc(kind, op.loc));

                for succ in dest.opcode(new_id).successors() {
                    dest.block_mut(succ).add_backedge(new_b);
                }
                let (lhs, out_env) = {
                    let new_op = dest.opcode(new_id);
                    (new_op.lhs(), new_op.out_env())
                };
                if let Some(lhs) = lhs {
                    dest.variable_mut(lhs).set_def_site(new_b, Some(new_id));
                }
                if let Some(env) = out_env {
                    dest.variable_mut(env).set_def_site(new_b, Some(new_id));
                }
            }
        }

        dup
    }

    pub fn block_of(&self, b: BlockId) -> BlockId {
        BlockId(b.0 + self.block_offset)
    }

    pub fn var_of(&self, v: VarId) -> VarId {
        VarId(v.0 + self.var_offset)
    }

    /// The duplicated entry block.
    pub fn entry(&self) -> BlockId {
        self.block_of(self.src_entry)
    }

    /// The duplicated exit block.
    pub fn exit(&self) -> BlockId {
        self.block_of(self.src_exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dominators::find_dominators;
    use crate::analysis::domtree::DomTree;
    use crate::analysis::ssa::SsaTranslator;
    use crate::builder::build_method;
    use crate::host::ast::{ArgsInfo, Node};
    use crate::host::ids::Id;
    use crate::host::value::Value;
    use std::rc::Rc;

    fn ssa_cfg(body: Node, locals: &[&str]) -> ControlFlowGraph {
        let root = Node::Scope {
            locals: locals.iter().map(|n| Id::intern(n)).collect(),
            args: ArgsInfo::required(0),
            body: Rc::new(body),
        };
        let mut built = build_method(&root, Id::intern("dup_target")).unwrap();
        let idoms = find_dominators(&built.cfg);
        let tree = DomTree::build(&built.cfg, &idoms);
        SsaTranslator::new(&mut built.cfg, &mut built.def_info, tree, true).translate();
        built.cfg
    }

    #[test]
    fn test_fresh_duplicate_passes_checks() {
        let src = ssa_cfg(
            Node::If {
                cond: Rc::new(Node::True),
                then: Some(Rc::new(Node::Literal(Value::Fixnum(1)))),
                els: Some(Rc::new(Node::Literal(Value::Fixnum(2)))),
            },
            &[],
        );
        let copy = CodeDuplicator::duplicate(&src);
        assert_eq!(copy.block_count(), src.block_count());
        assert_eq!(copy.variable_count(), src.variable_count());
        assert!(copy.check_sanity().is_empty(), "{:?}", copy.check_sanity());
        assert!(copy.check_ssa().is_empty(), "{:?}", copy.check_ssa());
    }

    #[test]
    fn test_incorporate_offsets_are_a_bijection() {
        let src = ssa_cfg(Node::Literal(Value::Fixnum(7)), &[]);
        let mut dest = ssa_cfg(Node::Nil, &[]);
        let mut src_types = TypeContext::new(&src);
        for v in src.var_ids() {
            src_types.set(v, TypeConstraint::Any);
        }
        let mut dest_types = TypeContext::new(&dest);

        let dest_blocks = dest.block_count();
        let dest_vars = dest.variable_count();
        let dup = CodeDuplicator::incorporate(&src, &src_types, &mut dest, &mut dest_types);

        assert_eq!(dest.block_count(), dest_blocks + src.block_count());
        assert_eq!(dest.variable_count(), dest_vars + src.variable_count());
        for b in src.block_ids() {
            assert_eq!(dup.block_of(b).index(), b.index() + dest_blocks);
        }
        for v in src.var_ids() {
            assert_eq!(dup.var_of(v).index(), v.index() + dest_vars);
        }
        assert_eq!(dest_types.len(), dest.variable_count());

        // The duplicated exit has no terminator: the Exit was dropped.
        assert!(dest.terminator_of(dup.exit()).is_none());
    }

    #[test]
    fn test_same_as_is_rebound() {
        let src = ssa_cfg(Node::Literal(Value::Fixnum(7)), &[]);
        let mut src_types = TypeContext::new(&src);
        for v in src.var_ids() {
            src_types.set(v, TypeConstraint::Any);
        }
        src_types.set(VarId(1), TypeConstraint::SameAs(VarId(0)));

        let mut dest = ssa_cfg(Node::Nil, &[]);
        let offset = dest.variable_count() as u32;
        let mut dest_types = TypeContext::new(&dest);
        let dup = CodeDuplicator::incorporate(&src, &src_types, &mut dest, &mut dest_types);

        assert_eq!(
            dest_types.type_of(dup.var_of(VarId(1))),
            Some(&TypeConstraint::SameAs(VarId(offset)))
        );
    }
}
