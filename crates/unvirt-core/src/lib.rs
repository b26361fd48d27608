/*! Core IR and optimization passes for devirtualizing lifted machine code.
 *
 * Virtualization-based protection folds many logical blocks into one dispatch loop, hides register
 * traffic behind an opaque state structure and buries constants under arithmetic noise. This crate
 * holds the IR those binaries are lifted into and the passes that peel the protection back:
 * alias classification, constant concretization, controlled node splitting and synthesis-based
 * simplification, sequenced by a budgeted fixpoint pipeline.
 */

pub mod analysis;
pub mod block;
pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod expr;
pub mod function;
pub mod instructions;
pub mod interp;
pub mod layout;
pub mod lift;
pub mod module;
pub mod passes;
pub mod pipeline;
pub mod types;
pub mod values;
pub mod verify;

pub use analysis::{AliasClass, AliasResult, AnalysisId, AnalysisManager};
pub use block::{BasicBlock, BlockId, Terminator};
pub use builder::{BlockBuilder, FunctionBuilder};
pub use config::{
    Budget, ClassifierConfig, ConcretizerConfig, PipelineConfig, SplitterConfig, SynthesisConfig,
};
pub use diagnostics::Diagnostic;
pub use expr::Expr;
pub use function::{FrameId, Function};
pub use instructions::{BinaryOp, CastKind, CmpPred, Instruction, UnaryOp};
pub use layout::{FieldKind, StateField, StateLayout};
pub use lift::{IrFragment, LiftError, Lifter, SemanticsProvider};
pub use module::{BinaryImage, Module, Segment};
pub use passes::PassKind;
pub use pipeline::{Pipeline, PipelineReport, PipelineState, PipelineStatus};
pub use types::Width;
pub use values::{Constant, Value, ValueId};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrError {
    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),
    #[error("Function not found: {0}")]
    FunctionNotFound(String),
    #[error("Invalid width: {0} bits")]
    InvalidWidth(u32),
    #[error("Verification failed in {function}: {message}")]
    Verification { function: String, message: String },
    #[error("Invalid state layout: {0}")]
    InvalidLayout(String),
    #[error("A process-wide state layout is already installed")]
    LayoutAlreadyInstalled,
    #[error("Builder error: {0}")]
    BuilderError(String),
    #[error("Lift error: {0}")]
    Lift(#[from] LiftError),
    #[error("Interpreter error: {0}")]
    Interpreter(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IrError>;
