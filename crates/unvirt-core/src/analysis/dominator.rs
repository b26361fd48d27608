use crate::analysis::cfg::ControlFlowGraph;
use crate::block::BlockId;
use std::collections::{HashMap, HashSet};

/// Iterative set-based dominators over the blocks reachable from the entry.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: HashMap<BlockId, BlockId>,
    children: HashMap<BlockId, Vec<BlockId>>,
    dominators: HashMap<BlockId, HashSet<BlockId>>,
}

impl DominatorTree {
    pub fn build(cfg: &ControlFlowGraph) -> Self {
        let blocks = cfg.reverse_postorder();
        let mut idom = HashMap::new();
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut doms: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();

        let Some(&entry) = blocks.first() else {
            return Self {
                idom,
                children,
                dominators: doms,
            };
        };

        let all: HashSet<BlockId> = blocks.iter().copied().collect();
        doms.insert(entry, HashSet::from([entry]));
        for &block in &blocks[1..] {
            doms.insert(block, all.clone());
        }

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &blocks[1..] {
                let mut new_dom: Option<HashSet<BlockId>> = None;
                for pred in cfg.reachable_predecessors(block) {
                    if let Some(pred_dom) = doms.get(&pred) {
                        new_dom = Some(match new_dom {
                            Some(acc) => acc.intersection(pred_dom).copied().collect(),
                            None => pred_dom.clone(),
                        });
                    }
                }

                if let Some(mut new_dom_set) = new_dom {
                    new_dom_set.insert(block);
                    if doms[&block] != new_dom_set {
                        doms.insert(block, new_dom_set);
                        changed = true;
                    }
                }
            }
        }

        for &block in &blocks[1..] {
            let dominators = &doms[&block];
            // The immediate dominator is the strict dominator with the largest dominator set.
            let candidate = dominators
                .iter()
                .filter(|&&d| d != block)
                .max_by_key(|d| doms.get(d).map_or(0, HashSet::len));
            if let Some(&candidate) = candidate {
                idom.insert(block, candidate);
                children.entry(candidate).or_default().push(block);
            }
        }

        Self {
            idom,
            children,
            dominators: doms,
        }
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.dominators.contains_key(&block)
    }

    pub fn dominates(&self, dominator: BlockId, dominated: BlockId) -> bool {
        self.dominators
            .get(&dominated)
            .is_some_and(|doms| doms.contains(&dominator))
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}
