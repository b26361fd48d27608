use crate::config::EmitterConfig;
use crate::emitter::{EmitContext, Emitter};
use crate::module_emitter::ModuleEmitter;
use anyhow::Result;
use std::io::Write;
use unvirt_core::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Write `module` in the requested format. JSON output can be read back with `Module::from_json`.
pub fn write_module<W: Write>(
    writer: &mut W,
    module: &Module,
    format: OutputFormat,
    config: &EmitterConfig,
) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let mut context = EmitContext::from_config(config);
            ModuleEmitter::new(config.clone()).emit(module, writer, &mut context)?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, module)?;
            writeln!(writer)?;
        }
    }
    Ok(())
}
