//! Configuration for the devirtualization pipeline.
//!
//! Every knob has a default; a JSON config only needs to name the values it
//! overrides.

use crate::passes::synth::EquivalencePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits that bound the whole pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    /// Maximum number of Classifying rounds (default: 16).
    pub max_iterations: usize,
    /// Maximum rewrites, clones and synthesis queries in total (default: 100000).
    pub max_operations: u64,
    /// Wall-clock limit, checked between stages.
    #[serde(with = "millis")]
    pub time_limit: Option<Duration>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_iterations: 16,
            max_operations: 100_000,
            time_limit: None,
        }
    }
}

impl Budget {
    #[must_use]
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    #[must_use]
    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.max_operations = max;
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Only accept state accesses that stay inside one named field.
    pub field_aligned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcretizerConfig {
    /// Rounds of local rewriting per stage before giving up on a fixpoint (default: 16).
    pub max_local_rounds: usize,
    /// Fold heap loads from read-only image segments.
    pub image_reads: bool,
}

impl Default for ConcretizerConfig {
    fn default() -> Self {
        Self {
            max_local_rounds: 16,
            image_reads: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Successor levels cloned together with a dispatch node (default: 2).
    pub horizon: usize,
    /// Per-function block budget (default: 4096).
    pub max_blocks: usize,
    /// Clones of one origin block across all iterations (default: 16).
    pub max_clones_per_origin: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            horizon: 2,
            max_blocks: 4096,
            max_clones_per_origin: 16,
        }
    }
}

impl SplitterConfig {
    #[must_use]
    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    #[must_use]
    pub fn with_max_clones_per_origin(mut self, max: usize) -> Self {
        self.max_clones_per_origin = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub enabled: bool,
    /// Worker threads for concurrent queries (default: 4).
    pub workers: usize,
    /// Per-query timeout.
    #[serde(with = "millis")]
    pub query_timeout: Option<Duration>,
    pub max_inputs: usize,
    pub max_instructions: usize,
    /// Fragments at or below this cost are not worth a query.
    pub min_cost: u32,
    /// Largest candidate the enumerator will build.
    pub max_candidate_cost: u32,
    /// Candidates examined per query before answering `NoSolution`.
    pub max_candidates: usize,
    /// Random test vectors used for pruning, on top of the corner cases.
    pub test_vectors: usize,
    pub seed: u64,
    pub policy: EquivalencePolicy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            query_timeout: Some(Duration::from_millis(2000)),
            max_inputs: 3,
            max_instructions: 8,
            min_cost: 3,
            max_candidate_cost: 3,
            max_candidates: 200_000,
            test_vectors: 24,
            seed: 0x5eed_cafe,
            policy: EquivalencePolicy::default(),
        }
    }
}

impl SynthesisConfig {
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: EquivalencePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub budget: Budget,
    pub classifier: ClassifierConfig,
    pub concretizer: ConcretizerConfig,
    pub splitter: SplitterConfig,
    pub synthesis: SynthesisConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_concretizer(mut self, concretizer: ConcretizerConfig) -> Self {
        self.concretizer = concretizer;
        self
    }

    #[must_use]
    pub fn with_splitter(mut self, splitter: SplitterConfig) -> Self {
        self.splitter = splitter;
        self
    }

    #[must_use]
    pub fn with_synthesis(mut self, synthesis: SynthesisConfig) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// `Option<Duration>` as a plain millisecond count.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
