/*! Devirtualization passes.
 *
 * Each pass attacks one layer of the protection: classification tags every memory access with the
 * region it touches, concretization folds values that are provably single-valued, node splitting
 * separates dispatch paths merged by the virtual machine loop, and synthesis replaces mixed
 * boolean-arithmetic noise with its cheapest equivalent. Passes are a closed set; the pipeline
 * drives them through `PassKind`.
 */

pub mod classify;
pub mod concretize;
pub mod split;
pub mod synth;
pub mod utils;

pub use classify::ClassifyPass;
pub use concretize::ConcretizePass;
pub use split::{ContextKey, DuplicationRecord, SplitPass};
pub use synth::SynthesisPass;

use crate::analysis::{AnalysisId, AnalysisManager};
use crate::diagnostics::Diagnostic;
use crate::module::Module;
use anyhow::Result;

/// Diagnostics and operation count accumulated by a pass since the last `take_ledger`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassLedger {
    pub diagnostics: Vec<Diagnostic>,
    /// Rewrites, clones and synthesis queries.
    pub operations: u64,
}

impl PassLedger {
    pub fn record(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn count(&mut self, operations: u64) {
        self.operations += operations;
    }
}

pub trait Pass {
    fn name(&self) -> &'static str;

    /// Run over the whole module. Returns whether the IR changed.
    fn run(&mut self, module: &mut Module, analyses: &mut AnalysisManager) -> Result<bool>;

    fn required_analyses(&self) -> Vec<AnalysisId> {
        Vec::new()
    }

    /// Analyses that are stale once this pass reports a change.
    fn invalidated_analyses(&self) -> Vec<AnalysisId> {
        AnalysisId::ALL.to_vec()
    }

    fn take_ledger(&mut self) -> PassLedger;

    /// Forget state carried over from a previous run on another module.
    fn reset(&mut self) {}
}

#[derive(Clone)]
pub enum PassKind {
    Classify(ClassifyPass),
    Concretize(ConcretizePass),
    Split(SplitPass),
    Synthesize(SynthesisPass),
}

impl PassKind {
    fn inner(&self) -> &dyn Pass {
        match self {
            PassKind::Classify(pass) => pass,
            PassKind::Concretize(pass) => pass,
            PassKind::Split(pass) => pass,
            PassKind::Synthesize(pass) => pass,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Pass {
        match self {
            PassKind::Classify(pass) => pass,
            PassKind::Concretize(pass) => pass,
            PassKind::Split(pass) => pass,
            PassKind::Synthesize(pass) => pass,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner().name()
    }

    pub fn run(&mut self, module: &mut Module, analyses: &mut AnalysisManager) -> Result<bool> {
        self.inner_mut().run(module, analyses)
    }

    pub fn required_analyses(&self) -> Vec<AnalysisId> {
        self.inner().required_analyses()
    }

    pub fn invalidated_analyses(&self) -> Vec<AnalysisId> {
        self.inner().invalidated_analyses()
    }

    pub fn take_ledger(&mut self) -> PassLedger {
        self.inner_mut().take_ledger()
    }

    pub fn reset(&mut self) {
        self.inner_mut().reset();
    }
}
