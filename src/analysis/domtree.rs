//! Dominator tree, stored out-of-line as parallel arrays indexed by block.

use crate::cfg::{BlockId, ControlFlowGraph};

#[derive(Debug, Clone, Copy, Default)]
struct DomNode {
    parent: Option<BlockId>,
    first_child: Option<BlockId>,
    next_sibling: Option<BlockId>,
}

/// `(first_child, next_sibling, parent)` triples, one per block.
///
/// Blocks without an immediate dominator (the entry, and anything
/// unreachable) are isolated nodes.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    nodes: Vec<DomNode>,
}

impl DomTree {
    /// Build the tree from an immediate-dominator map.
    pub fn build(cfg: &ControlFlowGraph, idoms: &[Option<BlockId>]) -> DomTree {
        let mut tree = DomTree {
            nodes: vec![DomNode::default(); cfg.block_count()],
        };
        for (i, idom) in idoms.iter().enumerate() {
            if let Some(parent) = idom {
                tree.add_child(*parent, BlockId(i as u32));
            }
        }
        tree
    }

    fn add_child(&mut self, parent: BlockId, child: BlockId) {
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[child.index()].next_sibling = self.nodes[parent.index()].first_child;
        self.nodes[parent.index()].first_child = Some(child);
    }

    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        self.nodes[b.index()].parent
    }

    pub fn first_child(&self, b: BlockId) -> Option<BlockId> {
        self.nodes[b.index()].first_child
    }

    pub fn next_sibling(&self, b: BlockId) -> Option<BlockId> {
        self.nodes[b.index()].next_sibling
    }

    /// Children of `b`, in reverse insertion order.
    pub fn children(&self, b: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cur = self.first_child(b);
        while let Some(c) = cur {
            out.push(c);
            cur = self.next_sibling(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_links() {
        // Diamond: 0 -> 1, 0 -> 2, both -> 3; idom(3) = 0.
        let mut cfg = ControlFlowGraph::new();
        for _ in 0..4 {
            cfg.add_block(None);
        }
        let idoms = vec![
            None,
            Some(BlockId(0)),
            Some(BlockId(0)),
            Some(BlockId(0)),
        ];
        let tree = DomTree::build(&cfg, &idoms);
        assert_eq!(tree.idom(BlockId(0)), None);
        assert_eq!(tree.idom(BlockId(3)), Some(BlockId(0)));
        let mut children = tree.children(BlockId(0));
        children.sort();
        assert_eq!(children, vec![BlockId(1), BlockId(2), BlockId(3)]);
    }
}
