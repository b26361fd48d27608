use crate::analysis::manager::AnalysisId;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub analysis: AnalysisId,
    pub function: String,
    pub generation: u64,
}

impl CacheKey {
    pub fn new(analysis: AnalysisId, function: impl Into<String>, generation: u64) -> Self {
        Self {
            analysis,
            function: function.into(),
            generation,
        }
    }
}

struct CacheEntry {
    value: Box<dyn Any + Send + Sync>,
}

/// LRU cache of per-function analysis results.
pub struct AnalysisCache {
    entries: HashMap<CacheKey, CacheEntry>,
    lru_order: VecDeque<CacheKey>,
    max_entries: usize,
    stats: CacheStatistics,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub total_compute_time: Duration,
}

impl AnalysisCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_order: VecDeque::new(),
            max_entries: max_entries.max(1),
            stats: CacheStatistics::default(),
        }
    }

    pub fn get_or_compute<T, F>(&mut self, key: CacheKey, compute: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(&key) {
            return value;
        }

        let start = Instant::now();
        let value = Arc::new(compute());
        self.stats.total_compute_time += start.elapsed();

        self.evict_if_needed();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value: Box::new(value.clone()),
            },
        );
        self.lru_order.push_back(key);

        value
    }

    pub fn get<T>(&mut self, key: &CacheKey) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let result = self
            .entries
            .get(key)
            .and_then(|entry| entry.value.downcast_ref::<Arc<T>>().cloned());

        if result.is_some() {
            self.stats.hits += 1;
            self.promote_lru(key);
        } else {
            self.stats.misses += 1;
        }

        result
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn invalidate<F>(&mut self, predicate: F)
    where
        F: Fn(&CacheKey) -> bool,
    {
        let keys_to_remove: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect();

        for key in keys_to_remove {
            if self.entries.remove(&key).is_some() {
                self.stats.invalidations += 1;
            }
            self.lru_order.retain(|k| k != &key);
        }
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.stats
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.stats.hits + self.stats.misses;
        if total == 0 {
            0.0
        } else {
            self.stats.hits as f64 / total as f64
        }
    }

    fn promote_lru(&mut self, key: &CacheKey) {
        self.lru_order.retain(|k| k != key);
        self.lru_order.push_back(key.clone());
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() >= self.max_entries {
            let Some(key) = self.lru_order.pop_front() else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                self.stats.evictions += 1;
            }
        }
    }
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new(256)
    }
}
