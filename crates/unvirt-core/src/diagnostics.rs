use crate::block::BlockId;
use crate::values::ValueId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recoverable conditions. Each one is recorded in the pipeline report and
/// logged; none of them stops the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diagnostic {
    /// An instruction the semantics provider could not model became an opaque effect.
    SemanticsGap { address: u64 },
    /// A memory access whose address could not be decomposed stayed `Unknown`.
    ClassificationAmbiguity {
        function: String,
        block: BlockId,
        index: usize,
    },
    /// A load whose reaching definitions disagree was left in place.
    ConcretizationConflict {
        function: String,
        block: BlockId,
        value: ValueId,
    },
    SplitBudgetExceeded { function: String, block: BlockId },
    SynthesisTimeout {
        function: String,
        block: BlockId,
        root: ValueId,
    },
    SynthesisNoSolution {
        function: String,
        block: BlockId,
        root: ValueId,
    },
    /// The backend proposed a candidate that could not be proven equivalent.
    SynthesisUnproven {
        function: String,
        block: BlockId,
        root: ValueId,
    },
    /// A stage failed or produced invalid IR and was rolled back.
    PassFault { stage: String, message: String },
}

impl Diagnostic {
    pub fn kind(&self) -> &'static str {
        match self {
            Diagnostic::SemanticsGap { .. } => "semantics-gap",
            Diagnostic::ClassificationAmbiguity { .. } => "classification-ambiguity",
            Diagnostic::ConcretizationConflict { .. } => "concretization-conflict",
            Diagnostic::SplitBudgetExceeded { .. } => "split-budget-exceeded",
            Diagnostic::SynthesisTimeout { .. } => "synthesis-timeout",
            Diagnostic::SynthesisNoSolution { .. } => "synthesis-no-solution",
            Diagnostic::SynthesisUnproven { .. } => "synthesis-unproven",
            Diagnostic::PassFault { .. } => "pass-fault",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::SemanticsGap { address } => {
                write!(f, "unmodeled instruction at {:#x}", address)
            }
            Diagnostic::ClassificationAmbiguity {
                function,
                block,
                index,
            } => write!(f, "{}:{}:{}: unclassified memory access", function, block, index),
            Diagnostic::ConcretizationConflict {
                function,
                block,
                value,
            } => write!(f, "{}:{}: conflicting definitions reach {}", function, block, value),
            Diagnostic::SplitBudgetExceeded { function, block } => {
                write!(f, "{}:{}: split budget exhausted", function, block)
            }
            Diagnostic::SynthesisTimeout {
                function,
                block,
                root,
            } => write!(f, "{}:{}: synthesis of {} timed out", function, block, root),
            Diagnostic::SynthesisNoSolution {
                function,
                block,
                root,
            } => write!(f, "{}:{}: no cheaper form for {}", function, block, root),
            Diagnostic::SynthesisUnproven {
                function,
                block,
                root,
            } => write!(
                f,
                "{}:{}: candidate for {} not proven equivalent",
                function, block, root
            ),
            Diagnostic::PassFault { stage, message } => {
                write!(f, "{} stage rolled back: {}", stage, message)
            }
        }
    }
}
