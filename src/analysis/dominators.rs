//! Immediate-dominator computation.
//!
//! The production path is Lengauer–Tarjan with path compression and
//! size/child balancing, near-linear in the number of edges. A second,
//! independent iterative finder (Cooper–Harvey–Kennedy) serves as the
//! oracle: debug builds compute both and compare.

use tracing::trace;

use crate::cfg::{BlockId, ControlFlowGraph};

/// Compute the immediate dominator of every block.
///
/// The entry has no dominator; unreachable blocks are left without one.
/// In debug builds the result is cross-checked against the iterative
/// finder, panicking on disagreement.
pub fn find_dominators(cfg: &ControlFlowGraph) -> Vec<Option<BlockId>> {
    let idoms = LtDominatorFinder::new(cfg).dominators();

    #[cfg(debug_assertions)]
    verify_against_cooper(cfg, &idoms);

    idoms
}

#[cfg(debug_assertions)]
fn verify_against_cooper(cfg: &ControlFlowGraph, lt: &[Option<BlockId>]) {
    let cooper = cooper_dominators(cfg);
    for b in cfg.block_ids() {
        // Lengauer-Tarjan leaves the exit undefined when it is unreachable.
        if b == cfg.exit() && lt[b.index()].is_none() {
            continue;
        }
        assert_eq!(
            lt[b.index()],
            cooper[b.index()],
            "dominator finders disagree on {:?}",
            b
        );
    }
}

// ============================================================================
// Lengauer-Tarjan
// ============================================================================

/// Internal vertices are 1-based; 0 means "none". Block `i` is vertex
/// `i + 1`.
struct LtDominatorFinder<'a> {
    cfg: &'a ControlFlowGraph,
    parent: Vec<usize>,
    ancestor: Vec<usize>,
    child: Vec<usize>,
    vertex: Vec<usize>,
    label: Vec<usize>,
    semi: Vec<usize>,
    size: Vec<usize>,
    dom: Vec<usize>,
    pred: Vec<Vec<usize>>,
    bucket: Vec<Vec<usize>>,
}

impl<'a> LtDominatorFinder<'a> {
    fn new(cfg: &'a ControlFlowGraph) -> LtDominatorFinder<'a> {
        let n = cfg.block_count() + 1;
        LtDominatorFinder {
            cfg,
            parent: vec![0; n],
            ancestor: vec![0; n],
            child: vec![0; n],
            vertex: vec![0; n],
            label: vec![0; n],
            semi: vec![0; n],
            size: vec![0; n],
            dom: vec![0; n],
            pred: vec![Vec::new(); n],
            bucket: vec![Vec::new(); n],
        }
    }

    fn dominators(mut self) -> Vec<Option<BlockId>> {
        self.find_dominators();

        let mut idoms = vec![None; self.cfg.block_count()];
        for (i, slot) in idoms.iter_mut().enumerate() {
            if self.dom[i + 1] != 0 {
                *slot = Some(BlockId((self.dom[i + 1] - 1) as u32));
            }
        }
        trace!(blocks = self.cfg.block_count(), "computed dominators");
        idoms
    }

    fn successors(&self, v: usize) -> smallvec::SmallVec<[BlockId; 2]> {
        self.cfg.successors_of(BlockId((v - 1) as u32))
    }

    fn find_dominators(&mut self) {
        // Step 1: depth-first search numbering the vertices as reached.
        self.dfs();

        let n = self.cfg.block_count();
        for i in (2..=n).rev() {
            let w = self.vertex[i];
            if w == 0 {
                // Unreachable block; never numbered.
                continue;
            }

            // Step 2: semidominators, in decreasing number order.
            for p in 0..self.pred[w].len() {
                let u = self.eval(self.pred[w][p]);
                if self.semi[u] < self.semi[w] {
                    self.semi[w] = self.semi[u];
                }
            }
            self.bucket[self.vertex[self.semi[w]]].push(w);
            self.link(self.parent[w], w);

            // Step 3: implicit immediate dominators.
            let b = std::mem::take(&mut self.bucket[self.parent[w]]);
            for &v in &b {
                let u = self.eval(v);
                self.dom[v] = if self.semi[u] < self.semi[v] {
                    u
                } else {
                    self.parent[w]
                };
            }
        }

        // Step 4: explicit immediate dominators, in increasing order.
        for i in 2..=n {
            let w = self.vertex[i];
            if w == 0 {
                continue;
            }
            if self.dom[w] != self.vertex[self.semi[w]] {
                self.dom[w] = self.dom[self.dom[w]];
            }
        }
    }

    fn dfs(&mut self) {
        let mut work: Vec<usize> = Vec::new();
        let mut n = 0;
        let mut v = self.cfg.entry().index() + 1;

        'outer: loop {
            // Chase first-successor chains, numbering as we go.
            loop {
                n += 1;
                self.semi[v] = n;
                self.vertex[n] = v;
                self.label[v] = v;
                self.ancestor[v] = 0;
                self.child[v] = 0;
                self.size[v] = 1;
                work.push(v);

                let succs = self.successors(v);
                let Some(next) = succs.first() else { break };
                let w = next.index() + 1;
                self.pred[w].push(v);
                if self.semi[w] != 0 {
                    break;
                }
                self.parent[w] = v;
                v = w;
            }

            // Pull the next unexplored alternate edge off the stack.
            loop {
                let Some(top) = work.pop() else { return };
                let succs = self.successors(top);
                let Some(alt) = succs.get(1) else { continue };
                let w = alt.index() + 1;
                self.pred[w].push(top);
                if self.semi[w] == 0 {
                    self.parent[w] = top;
                    v = w;
                    continue 'outer;
                }
            }
        }
    }

    fn compress(&mut self, v: usize) {
        if self.ancestor[self.ancestor[v]] != 0 {
            self.compress(self.ancestor[v]);
            if self.semi[self.label[self.ancestor[v]]] < self.semi[self.label[v]] {
                self.label[v] = self.label[self.ancestor[v]];
            }
            self.ancestor[v] = self.ancestor[self.ancestor[v]];
        }
    }

    fn eval(&mut self, v: usize) -> usize {
        if self.ancestor[v] == 0 {
            return self.label[v];
        }
        self.compress(v);
        if self.semi[self.label[self.ancestor[v]]] >= self.semi[self.label[v]] {
            self.label[v]
        } else {
            self.label[self.ancestor[v]]
        }
    }

    fn link(&mut self, v: usize, w: usize) {
        let mut s = w;
        while self.semi[self.label[w]] < self.semi[self.label[self.child[s]]] {
            if self.size[s] + self.size[self.child[self.child[s]]] >= 2 * self.size[self.child[s]]
            {
                self.ancestor[self.child[s]] = s;
                self.child[s] = self.child[self.child[s]];
            } else {
                self.size[self.child[s]] = self.size[s];
                self.ancestor[s] = self.child[s];
                s = self.child[s];
            }
        }
        self.label[s] = self.label[w];
        self.size[v] += self.size[w];
        if self.size[v] < 2 * self.size[w] {
            std::mem::swap(&mut s, &mut self.child[v]);
        }
        while s != 0 {
            self.ancestor[s] = v;
            s = self.child[s];
        }
    }
}

// ============================================================================
// Cooper iterative finder
// ============================================================================

/// The "engineered" iterative dominator algorithm: reverse-postorder sweeps
/// with two-finger intersection until a fixed point. Quadratic in the worst
/// case; used as the debug oracle for the Lengauer-Tarjan result.
pub fn cooper_dominators(cfg: &ControlFlowGraph) -> Vec<Option<BlockId>> {
    let n = cfg.block_count();
    let mut postorder_num = vec![usize::MAX; n];
    let mut postorder: Vec<BlockId> = Vec::with_capacity(n);
    compute_postorder(cfg, cfg.entry(), &mut postorder_num, &mut postorder);

    let mut idoms: Vec<Option<BlockId>> = vec![None; n];
    idoms[cfg.entry().index()] = Some(cfg.entry());

    let mut changed = true;
    while changed {
        changed = false;
        for &b in postorder.iter().rev() {
            if b == cfg.entry() {
                continue;
            }
            let mut new_idom: Option<BlockId> = None;
            for &pred in cfg.block(b).backedges() {
                if idoms[pred.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(cur) => intersect(&idoms, &postorder_num, pred, cur),
                });
            }
            if let Some(idom) = new_idom {
                if idoms[b.index()] != Some(idom) {
                    idoms[b.index()] = Some(idom);
                    changed = true;
                }
            }
        }
    }

    idoms[cfg.entry().index()] = None;
    idoms
}

fn compute_postorder(
    cfg: &ControlFlowGraph,
    b: BlockId,
    numbers: &mut [usize],
    order: &mut Vec<BlockId>,
) {
    if numbers[b.index()] != usize::MAX {
        return;
    }
    numbers[b.index()] = 0; // visiting marker
    for succ in cfg.successors_of(b) {
        compute_postorder(cfg, succ, numbers, order);
    }
    numbers[b.index()] = order.len();
    order.push(b);
}

fn intersect(
    idoms: &[Option<BlockId>],
    postorder_num: &[usize],
    mut b1: BlockId,
    mut b2: BlockId,
) -> BlockId {
    while b1 != b2 {
        while postorder_num[b1.index()] < postorder_num[b2.index()] {
            b1 = idoms[b1.index()].expect("processed predecessor");
        }
        while postorder_num[b2.index()] < postorder_num[b1.index()] {
            b2 = idoms[b2.index()].expect("processed predecessor");
        }
    }
    b1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Opcode, OpcodeKind, VarId};

    /// Build a CFG from an edge list; block 0 is the entry. Conditional
    /// blocks get a JumpIf over a dummy variable.
    fn graph(n: usize, edges: &[(u32, u32)]) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new();
        for _ in 0..n {
            cfg.add_block(None);
        }
        cfg.set_entry(BlockId(0));
        cfg.set_exit(BlockId((n - 1) as u32));
        let cond = cfg.create_variable(None, None, BlockId(0), None);
        let _ = cond;
        for b in 0..n as u32 {
            let outs: Vec<u32> = edges
                .iter()
                .filter(|(from, _)| *from == b)
                .map(|(_, to)| *to)
                .collect();
            match outs.len() {
                0 => {
                    cfg.append_opcode(BlockId(b), Opcode::new(OpcodeKind::Exit));
                }
                1 => {
                    cfg.append_opcode(
                        BlockId(b),
                        Opcode::new(OpcodeKind::Jump {
                            target: BlockId(outs[0]),
                        }),
                    );
                    cfg.block_mut(BlockId(outs[0])).add_backedge(BlockId(b));
                }
                2 => {
                    cfg.append_opcode(
                        BlockId(b),
                        Opcode::new(OpcodeKind::JumpIf {
                            cond: VarId(0),
                            if_true: BlockId(outs[0]),
                            if_false: BlockId(outs[1]),
                        }),
                    );
                    cfg.block_mut(BlockId(outs[0])).add_backedge(BlockId(b));
                    cfg.block_mut(BlockId(outs[1])).add_backedge(BlockId(b));
                }
                _ => panic!("at most two successors"),
            }
        }
        cfg
    }

    fn ids(v: &[Option<u32>]) -> Vec<Option<BlockId>> {
        v.iter().map(|o| o.map(BlockId)).collect()
    }

    #[test]
    fn test_diamond() {
        // 0 -> {1, 2} -> 3
        let cfg = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let idoms = find_dominators(&cfg);
        assert_eq!(idoms, ids(&[None, Some(0), Some(0), Some(0)]));
    }

    #[test]
    fn test_loop_shape() {
        // 0 -> 1 (header) -> {2 (body), 3 (exit)}, 2 -> 1
        let cfg = graph(4, &[(0, 1), (1, 2), (1, 3), (2, 1)]);
        let idoms = find_dominators(&cfg);
        assert_eq!(idoms, ids(&[None, Some(0), Some(1), Some(1)]));
    }

    #[test]
    fn test_nested_chain() {
        // 0 -> {1, 4}; 1 -> {2, 3}; 2 -> 3; 3 -> 4
        let cfg = graph(5, &[(0, 1), (0, 4), (1, 2), (1, 3), (2, 3), (3, 4)]);
        let idoms = find_dominators(&cfg);
        assert_eq!(idoms, ids(&[None, Some(0), Some(1), Some(1), Some(0)]));
    }

    #[test]
    fn test_finders_agree_on_irreducible_shape() {
        // 0 -> {1, 2}; 1 -> 2; 2 -> {1, 3}: a loop entered at two points.
        let cfg = graph(4, &[(0, 1), (0, 2), (1, 2), (2, 1), (2, 3)]);
        let lt = LtDominatorFinder::new(&cfg).dominators();
        let cooper = cooper_dominators(&cfg);
        assert_eq!(lt, cooper);
        assert_eq!(lt, ids(&[None, Some(0), Some(0), Some(2)]));
    }
}
