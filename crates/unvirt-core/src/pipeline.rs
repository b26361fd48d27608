/*! Budgeted fixpoint orchestration of the devirtualization passes.
 *
 * Every pass can expose work for the others: a folded dispatch check makes a node splittable, a
 * split makes selectors constant, and a synthesized simplification can turn an address into a
 * precise one. The pipeline therefore loops over the stages until none of them changes the module
 * or the budget runs out. Each stage runs against a snapshot; a stage that fails or leaves the IR
 * malformed is rolled back and recorded as a diagnostic.
 */

use crate::analysis::AnalysisManager;
use crate::config::PipelineConfig;
use crate::diagnostics::Diagnostic;
use crate::instructions::Instruction;
use crate::module::Module;
use crate::passes::split::DuplicationRecord;
use crate::passes::synth::{CancelToken, SynthesisBackend};
use crate::passes::{ClassifyPass, ConcretizePass, PassKind, SplitPass, SynthesisPass};
use crate::verify::verify_module;
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Classifying,
    Concretizing,
    Splitting,
    Synthesizing,
    Converged,
    BudgetExceeded,
}

impl PipelineState {
    /// The state after this one finished, given whether it changed the module.
    pub fn next(self, changed: bool) -> PipelineState {
        match self {
            PipelineState::Idle => PipelineState::Classifying,
            PipelineState::Classifying => PipelineState::Concretizing,
            PipelineState::Concretizing | PipelineState::Splitting | PipelineState::Synthesizing
                if changed =>
            {
                PipelineState::Classifying
            }
            PipelineState::Concretizing => PipelineState::Splitting,
            PipelineState::Splitting => PipelineState::Synthesizing,
            PipelineState::Synthesizing => PipelineState::Converged,
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Converged | PipelineState::BudgetExceeded
        )
    }

    fn stage_index(self) -> Option<usize> {
        match self {
            PipelineState::Classifying => Some(0),
            PipelineState::Concretizing => Some(1),
            PipelineState::Splitting => Some(2),
            PipelineState::Synthesizing => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Classifying => "classifying",
            PipelineState::Concretizing => "concretizing",
            PipelineState::Splitting => "splitting",
            PipelineState::Synthesizing => "synthesizing",
            PipelineState::Converged => "converged",
            PipelineState::BudgetExceeded => "budget-exceeded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Converged,
    /// The module is valid but may not be fully optimized.
    BudgetExceeded,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Converged => write!(f, "converged"),
            PipelineStatus::BudgetExceeded => write!(f, "budget exceeded"),
        }
    }
}

/// One executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub iteration: usize,
    pub stage: String,
    pub changed: bool,
    pub operations: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub iterations: usize,
    pub operations: u64,
    pub elapsed: Duration,
    pub stage_changes: Vec<StageRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub duplication: DuplicationRecord,
}

impl PipelineReport {
    pub fn is_converged(&self) -> bool {
        self.status == PipelineStatus::Converged
    }

    pub fn diagnostics_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind() == kind)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives the four passes through the stage state machine.
pub struct Pipeline {
    config: PipelineConfig,
    passes: Vec<PassKind>,
    analyses: AnalysisManager,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let passes = vec![
            PassKind::Classify(ClassifyPass::new(config.classifier.clone())),
            PassKind::Concretize(ConcretizePass::new(config.concretizer.clone())),
            PassKind::Split(SplitPass::new(config.splitter.clone())),
            PassKind::Synthesize(SynthesisPass::new(config.synthesis.clone())),
        ];
        Self {
            config,
            passes,
            analyses: AnalysisManager::new(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_synthesis_backend(mut self, backend: Arc<dyn SynthesisBackend>) -> Self {
        for pass in &mut self.passes {
            if let PassKind::Synthesize(synth) = pass {
                *synth = synth.clone().with_backend(Arc::clone(&backend));
            }
        }
        self
    }

    /// A handle that stops the current run between stages and cancels
    /// synthesis queries in flight.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn duplication(&self) -> DuplicationRecord {
        self.passes
            .iter()
            .find_map(|pass| match pass {
                PassKind::Split(split) => Some(split.record().clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn run(&mut self, module: &mut Module) -> PipelineReport {
        let started = Instant::now();
        let budget = self.config.budget.clone();
        let token = match budget.time_limit {
            Some(limit) => self.cancel.child(Some(limit)),
            None => self.cancel.clone(),
        };
        // Cached analyses are keyed by function name, so nothing survives into a new run.
        self.analyses = AnalysisManager::new();
        for pass in &mut self.passes {
            pass.reset();
            if let PassKind::Synthesize(synth) = pass {
                synth.set_cancel_token(token.clone());
            }
        }

        let mut state = PipelineState::Idle;
        let mut iterations = 0usize;
        let mut operations = 0u64;
        let mut diagnostics = semantics_gaps(module);
        let mut stage_changes = Vec::new();

        while !state.is_terminal() {
            if state == PipelineState::Classifying && iterations >= budget.max_iterations {
                info!(iterations, "iteration budget exhausted");
                state = PipelineState::BudgetExceeded;
                break;
            }
            let Some(index) = state.stage_index() else {
                state = state.next(false);
                continue;
            };
            if state == PipelineState::Classifying {
                iterations += 1;
            }

            let record = self.run_stage(index, iterations, module, &mut diagnostics);
            operations += record.operations;
            let changed = record.changed;
            stage_changes.push(record);

            if operations > budget.max_operations {
                info!(operations, "operation budget exhausted");
                state = PipelineState::BudgetExceeded;
            } else if token.is_cancelled() {
                info!(elapsed = ?started.elapsed(), "time budget exhausted");
                state = PipelineState::BudgetExceeded;
            } else {
                state = state.next(changed);
            }
        }

        let status = if state == PipelineState::Converged {
            PipelineStatus::Converged
        } else {
            PipelineStatus::BudgetExceeded
        };
        let report = PipelineReport {
            status,
            iterations,
            operations,
            elapsed: started.elapsed(),
            stage_changes,
            diagnostics: diagnostics.into_iter().collect(),
            duplication: self.duplication(),
        };
        info!(
            module = %module.name,
            %status,
            iterations,
            operations,
            diagnostics = report.diagnostics.len(),
            "pipeline finished"
        );
        let cache = self.analyses.statistics();
        debug!(
            hits = cache.hits,
            misses = cache.misses,
            evictions = cache.evictions,
            hit_rate = self.analyses.hit_rate(),
            "analysis cache"
        );
        report
    }

    fn run_stage(
        &mut self,
        index: usize,
        iteration: usize,
        module: &mut Module,
        diagnostics: &mut IndexSet<Diagnostic>,
    ) -> StageRecord {
        let pass = &mut self.passes[index];
        let name = pass.name();
        let span = info_span!("stage", stage = name, iteration);
        let _enter = span.enter();

        let required = pass.required_analyses();
        for function in module.functions.values() {
            self.analyses.ensure(function, &required);
        }

        let module_snapshot = module.clone();
        let pass_snapshot = pass.clone();
        let started = Instant::now();

        let outcome = pass.run(module, &mut self.analyses).and_then(|changed| {
            verify_module(module)?;
            Ok(changed)
        });
        let ledger = pass.take_ledger();

        let (changed, operations) = match outcome {
            Ok(changed) => {
                for diagnostic in ledger.diagnostics {
                    if diagnostics.insert(diagnostic.clone()) {
                        debug!(kind = diagnostic.kind(), %diagnostic, "diagnostic");
                    }
                }
                if changed {
                    let invalidated = pass.invalidated_analyses();
                    for function in module.functions.keys() {
                        self.analyses.invalidate(function, &invalidated);
                    }
                }
                (changed, ledger.operations)
            }
            Err(err) => {
                warn!(stage = name, error = %err, "stage failed, restoring snapshot");
                *module = module_snapshot;
                *pass = pass_snapshot;
                self.analyses.invalidate_all();
                diagnostics.insert(Diagnostic::PassFault {
                    stage: name.to_string(),
                    message: err.to_string(),
                });
                (false, 0)
            }
        };

        debug!(changed, operations, "stage finished");
        StageRecord {
            iteration,
            stage: name.to_string(),
            changed,
            operations,
            duration: started.elapsed(),
        }
    }
}

/// Optimize independent modules in parallel, one pipeline per module.
pub fn optimize_modules(modules: &mut [Module], config: &PipelineConfig) -> Vec<PipelineReport> {
    modules
        .par_iter_mut()
        .map(|module| Pipeline::new(config.clone()).run(module))
        .collect()
}

fn semantics_gaps(module: &Module) -> IndexSet<Diagnostic> {
    module
        .functions
        .values()
        .flat_map(|function| function.blocks.values())
        .flat_map(|block| block.instructions.iter())
        .filter_map(|inst| match inst {
            Instruction::Opaque { address, .. } => Some(Diagnostic::SemanticsGap { address: *address }),
            _ => None,
        })
        .collect()
}
