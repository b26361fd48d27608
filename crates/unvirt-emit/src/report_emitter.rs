use crate::config::EmitterConfig;
use crate::emitter::{EmitContext, EmitHelper, EmitResult, Emitter, Highlight};
use anyhow::Result;
use std::io::Write;
use unvirt_core::{PipelineReport, PipelineStatus};

/// Summarizes a pipeline run: status, stage history, diagnostics and splits.
pub struct ReportEmitter {
    config: EmitterConfig,
}

impl ReportEmitter {
    pub fn new(config: EmitterConfig) -> Self {
        Self { config }
    }
}

impl Default for ReportEmitter {
    fn default() -> Self {
        Self::new(EmitterConfig::default())
    }
}

impl Emitter for ReportEmitter {
    type Item = PipelineReport;

    fn emit<W: Write>(
        &self,
        report: &PipelineReport,
        writer: &mut W,
        context: &mut EmitContext,
    ) -> EmitResult {
        let status = report.status.to_string();
        let status = match report.status {
            PipelineStatus::Converged => Highlight::Header.paint(&status, context.use_colors),
            PipelineStatus::BudgetExceeded => Highlight::Warning.paint(&status, context.use_colors),
        };
        EmitHelper::write_line(writer, context, &format!("status: {}", status))?;
        EmitHelper::write_line(writer, context, &format!("iterations: {}", report.iterations))?;
        EmitHelper::write_line(writer, context, &format!("operations: {}", report.operations))?;
        EmitHelper::write_line(writer, context, &format!("elapsed: {:?}", report.elapsed))?;

        if self.config.verbosity.should_print_statistics() {
            EmitHelper::write_section(writer, context, "Stages")?;
            context.indent();
            for stage in &report.stage_changes {
                let line = format!(
                    "#{} {:<10} {:<9} {} ops",
                    stage.iteration,
                    stage.stage,
                    if stage.changed { "changed" } else { "unchanged" },
                    stage.operations
                );
                EmitHelper::write_line(writer, context, &line)?;
            }
            context.dedent();
        }

        if !report.diagnostics.is_empty() {
            EmitHelper::write_section(writer, context, "Diagnostics")?;
            context.indent();
            for diagnostic in &report.diagnostics {
                let line = format!("[{}] {}", diagnostic.kind(), diagnostic);
                EmitHelper::write_highlighted(writer, context, &line, Highlight::Comment)?;
            }
            context.dedent();
        }

        if !report.duplication.is_empty() {
            EmitHelper::write_section(writer, context, "Splits")?;
            context.indent();
            for record in report.duplication.origins() {
                for (key, clone) in &record.clones {
                    let line = format!("{}:{} {} -> {}", record.function, record.origin, key, clone);
                    EmitHelper::write_line(writer, context, &line)?;
                }
            }
            context.dedent();
        }
        Ok(())
    }

    fn emit_to_string(&self, report: &PipelineReport) -> Result<String> {
        let mut buffer = Vec::new();
        let mut context = EmitContext::from_config(&self.config);
        self.emit(report, &mut buffer, &mut context)?;
        Ok(String::from_utf8(buffer)?)
    }
}
