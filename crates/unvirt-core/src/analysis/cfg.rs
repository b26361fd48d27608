use crate::block::BlockId;
use crate::function::Function;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub entry: BlockId,
    edges: HashMap<BlockId, Vec<BlockId>>,
    reverse_edges: HashMap<BlockId, Vec<BlockId>>,
    reachable: HashSet<BlockId>,
    rpo: Vec<BlockId>,
}

impl ControlFlowGraph {
    pub fn build(function: &Function) -> Self {
        let mut edges = HashMap::new();
        let mut reverse_edges: HashMap<BlockId, Vec<BlockId>> = HashMap::new();

        for (block_id, block) in &function.blocks {
            let mut seen = HashSet::new();
            let successors: Vec<BlockId> = block
                .terminator
                .successors()
                .into_iter()
                .filter(|s| function.blocks.contains_key(s) && seen.insert(*s))
                .collect();

            for &succ in &successors {
                let preds = reverse_edges.entry(succ).or_default();
                if !preds.contains(block_id) {
                    preds.push(*block_id);
                }
            }
            edges.insert(*block_id, successors);
        }

        let mut cfg = Self {
            entry: function.entry,
            edges,
            reverse_edges,
            reachable: HashSet::new(),
            rpo: Vec::new(),
        };
        cfg.compute_order();
        cfg
    }

    fn compute_order(&mut self) {
        let mut visited = HashSet::new();
        let mut postorder = Vec::new();
        let mut stack: Vec<(BlockId, usize)> = Vec::new();

        if self.edges.contains_key(&self.entry) {
            visited.insert(self.entry);
            stack.push((self.entry, 0));
        }

        while let Some((block, next)) = stack.pop() {
            let succs = self.successors(block);
            if next < succs.len() {
                let succ = succs[next];
                stack.push((block, next + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }

        postorder.reverse();
        self.reachable = visited;
        self.rpo = postorder;
    }

    /// Distinct successors in terminator order.
    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.edges.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Distinct predecessors, reachable or not.
    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.reverse_edges
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn reachable_predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.predecessors(block)
            .iter()
            .copied()
            .filter(|p| self.reachable.contains(p))
            .collect()
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.contains(&block)
    }

    /// Reachable blocks in reverse postorder, entry first.
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }
}
