use crate::expr::Expr;
use crate::types::Width;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation shared between the orchestrator and every query.
///
/// Children share the parent's flag, so cancelling any token in a family
/// cancels all of them, and inherit the earlier of the two deadlines.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub width: Width,
    pub reference: Expr,
    pub side_effect_free: bool,
}

/// One synthesis query: find an expression over `inputs` equal to the
/// reference whose cost does not exceed `cost_bound`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub inputs: Vec<Width>,
    pub spec: OutputSpec,
    pub cost_bound: u32,
}

impl SynthesisRequest {
    pub fn new(reference: Expr, arity: usize, width: Width, cost_bound: u32) -> Self {
        Self {
            inputs: vec![width; arity],
            spec: OutputSpec {
                width,
                reference,
                side_effect_free: true,
            },
            cost_bound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynthesisResponse {
    Expression(Expr),
    NoSolution,
    Timeout,
}

pub trait SynthesisBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Answer `request`, returning `Timeout` as soon as `cancel` fires.
    fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> SynthesisResponse;
}
