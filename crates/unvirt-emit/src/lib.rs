/*! Turn devirtualized modules and pipeline reports into readable text.
 *
 * The optimized IR is what an analyst actually reads, so the emitters keep the structure of the
 * module visible: one brace block per function, labelled blocks with their guest address and clone
 * origin, and memory accesses tagged with the register or frame slot they touch.
 */

pub mod config;
pub mod emitter;
pub mod module_emitter;
pub mod output;
pub mod report_emitter;

pub use config::{EmitterConfig, IndentStyle, VerbosityLevel};
pub use emitter::{EmitContext, EmitHelper, EmitResult, Emitter, Highlight};
pub use module_emitter::ModuleEmitter;
pub use output::{write_module, OutputFormat};
pub use report_emitter::ReportEmitter;
