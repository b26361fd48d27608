/*! Unified interface for devirtualizing lifted machine code.
 *
 * Single import for the whole workflow: build or load a module, run the devirtualization pipeline
 * under a budget, and print the result. The individual crates stay reachable for callers that need
 * a single pass or a custom synthesis backend.
 */

pub use unvirt_core as core;
pub use unvirt_emit as emit;

pub use unvirt_core::{
    BasicBlock, BlockId, Budget, Diagnostic, Function, FunctionBuilder, Instruction, Module,
    Pipeline, PipelineConfig, PipelineReport, PipelineStatus, StateLayout, Terminator, Value,
    Width,
};

pub use unvirt_core::pipeline::optimize_modules;
pub use unvirt_emit::{EmitterConfig, ModuleEmitter, OutputFormat, ReportEmitter};

use anyhow::Context;

/// Run the full pipeline with default pass settings under `budget`.
///
/// The module is consumed and returned in its optimized form. A run that hits
/// the budget still returns a structurally valid module.
pub fn run_pipeline(mut module: Module, budget: Budget) -> (Module, PipelineReport) {
    let config = PipelineConfig::default().with_budget(budget);
    let report = Pipeline::new(config).run(&mut module);
    (module, report)
}

/// An empty module over the process-wide state layout.
pub fn new_module(name: impl Into<String>) -> Module {
    Module::new(name, StateLayout::global_or_default())
}

/// Load a JSON module, optimize it with `config` and return both results.
pub fn optimize_json(json: &str, config: PipelineConfig) -> anyhow::Result<(Module, PipelineReport)> {
    let mut module = Module::from_json(json).context("failed to parse module")?;
    let report = Pipeline::new(config).run(&mut module);
    Ok((module, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Module {
        let mut builder = FunctionBuilder::new("f");
        let mut entry = builder.entry_block();
        entry.store_state(0, Value::konst(7, Width::W64), Width::W64);
        let rax = entry.load_state(0, Width::W64);
        entry.call_void(0x1000, vec![rax]);
        entry.ret().unwrap();
        let mut module = new_module("facade");
        module.add_function(builder.build().unwrap());
        module
    }

    #[test]
    fn test_run_pipeline() {
        let (optimized, report) = run_pipeline(module(), Budget::default());
        assert_eq!(report.status, PipelineStatus::Converged);
        let entry = optimized.function("f").unwrap().entry_block();
        assert!(entry.instructions.iter().any(|inst| matches!(
            inst,
            Instruction::Call { args, .. } if args == &vec![Value::konst(7, Width::W64)]
        )));
    }

    #[test]
    fn test_run_pipeline_out_of_budget() {
        let (optimized, report) = run_pipeline(module(), Budget::default().with_max_iterations(0));
        assert_eq!(report.status, PipelineStatus::BudgetExceeded);
        assert_eq!(optimized, module());
    }

    #[test]
    fn test_optimize_json() {
        let json = module().to_json().unwrap();
        let (_, report) = optimize_json(&json, PipelineConfig::default()).unwrap();
        assert!(report.is_converged());
        assert!(optimize_json("{", PipelineConfig::default()).is_err());
    }
}
