use crate::analysis::cache::{AnalysisCache, CacheKey, CacheStatistics};
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::def_use::DefUseChains;
use crate::analysis::dominator::DominatorTree;
use crate::analysis::memory::MemoryFacts;
use crate::function::Function;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisId {
    ControlFlow,
    Dominators,
    MemoryFacts,
    DefUse,
}

impl AnalysisId {
    pub const ALL: [AnalysisId; 4] = [
        AnalysisId::ControlFlow,
        AnalysisId::Dominators,
        AnalysisId::MemoryFacts,
        AnalysisId::DefUse,
    ];

    /// Analyses whose results are derived from this one.
    pub fn dependents(self) -> &'static [AnalysisId] {
        match self {
            AnalysisId::ControlFlow => &[AnalysisId::Dominators, AnalysisId::MemoryFacts],
            AnalysisId::Dominators | AnalysisId::MemoryFacts | AnalysisId::DefUse => &[],
        }
    }
}

/// Computes analyses on demand and keeps them until a pass declares them invalid.
pub struct AnalysisManager {
    cache: AnalysisCache,
    generation: u64,
}

impl AnalysisManager {
    pub fn new() -> Self {
        Self {
            cache: AnalysisCache::default(),
            generation: 0,
        }
    }

    fn key(&self, analysis: AnalysisId, function: &Function) -> CacheKey {
        CacheKey::new(analysis, function.name.clone(), self.generation)
    }

    pub fn control_flow(&mut self, function: &Function) -> Arc<ControlFlowGraph> {
        let key = self.key(AnalysisId::ControlFlow, function);
        self.cache
            .get_or_compute(key, || ControlFlowGraph::build(function))
    }

    pub fn dominators(&mut self, function: &Function) -> Arc<DominatorTree> {
        let cfg = self.control_flow(function);
        let key = self.key(AnalysisId::Dominators, function);
        self.cache.get_or_compute(key, || DominatorTree::build(&cfg))
    }

    pub fn memory_facts(&mut self, function: &Function) -> Arc<MemoryFacts> {
        let cfg = self.control_flow(function);
        let key = self.key(AnalysisId::MemoryFacts, function);
        self.cache
            .get_or_compute(key, || MemoryFacts::compute(function, &cfg))
    }

    pub fn def_use(&mut self, function: &Function) -> Arc<DefUseChains> {
        let key = self.key(AnalysisId::DefUse, function);
        self.cache
            .get_or_compute(key, || DefUseChains::build(function))
    }

    /// Compute every analysis in `required` for `function`.
    pub fn ensure(&mut self, function: &Function, required: &[AnalysisId]) {
        for analysis in required {
            match analysis {
                AnalysisId::ControlFlow => {
                    self.control_flow(function);
                }
                AnalysisId::Dominators => {
                    self.dominators(function);
                }
                AnalysisId::MemoryFacts => {
                    self.memory_facts(function);
                }
                AnalysisId::DefUse => {
                    self.def_use(function);
                }
            }
        }
    }

    pub fn is_cached(&self, analysis: AnalysisId, function: &Function) -> bool {
        self.cache.contains(&self.key(analysis, function))
    }

    /// Drop `analyses`, and everything derived from them, for one function.
    pub fn invalidate(&mut self, function: &str, analyses: &[AnalysisId]) {
        let mut doomed: Vec<AnalysisId> = analyses.to_vec();
        for analysis in analyses {
            doomed.extend_from_slice(analysis.dependents());
        }
        trace!(function, ?doomed, "invalidating analyses");
        self.cache
            .invalidate(|k| k.function == function && doomed.contains(&k.analysis));
    }

    /// Drop every cached result, e.g. after a module snapshot was restored.
    pub fn invalidate_all(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.cache.invalidate(|k| k.generation < generation);
    }

    pub fn statistics(&self) -> &CacheStatistics {
        self.cache.statistics()
    }

    pub fn hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }
}

impl Default for AnalysisManager {
    fn default() -> Self {
        Self::new()
    }
}
