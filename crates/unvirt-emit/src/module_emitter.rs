use crate::config::EmitterConfig;
use crate::emitter::{EmitContext, EmitHelper, EmitResult, Emitter, Highlight};
use anyhow::Result;
use std::io::Write;
use unvirt_core::{AliasClass, BasicBlock, Function, Instruction, Module, StateLayout, Terminator};

/// Prints a module as annotated text, one function per brace block.
pub struct ModuleEmitter {
    config: EmitterConfig,
}

impl ModuleEmitter {
    pub fn new(config: EmitterConfig) -> Self {
        Self { config }
    }

    fn emit_function<W: Write>(
        &self,
        function: &Function,
        writer: &mut W,
        context: &mut EmitContext,
    ) -> EmitResult {
        let header = format!("function {}", function.name);
        EmitHelper::write_block(writer, context, &header, |w, ctx| {
            if self.config.verbosity.should_print_statistics() {
                let comment = format!(
                    "{} blocks, {} instructions",
                    function.blocks.len(),
                    function.instruction_count()
                );
                EmitHelper::write_comment(w, ctx, &comment)?;
            }
            for block in function.blocks.values() {
                self.emit_block(function, block, w, ctx)?;
            }
            Ok(())
        })
    }

    fn emit_block<W: Write>(
        &self,
        function: &Function,
        block: &BasicBlock,
        writer: &mut W,
        context: &mut EmitContext,
    ) -> EmitResult {
        let mut notes = Vec::new();
        if block.id == function.entry {
            notes.push("entry".to_string());
        }
        if self.config.include_block_info {
            if let Some(address) = block.address {
                notes.push(format!("at {:#x}", address));
            }
            if let Some(origin) = block.origin {
                notes.push(format!("clone of {}", origin));
            }
        }

        let mut label = Highlight::Label.paint(&format!("{}:", block.id), context.use_colors);
        if !notes.is_empty() {
            let comment = format!("  ; {}", notes.join(", "));
            label.push_str(&Highlight::Comment.paint(&comment, context.use_colors));
        }
        EmitHelper::write_line(writer, context, &label)?;

        context.indent();
        for inst in &block.instructions {
            EmitHelper::write_highlighted(writer, context, &inst.to_string(), instruction_highlight(inst))?;
        }
        let highlight = match block.terminator {
            Terminator::Trap(_) => Highlight::Warning,
            _ => Highlight::Control,
        };
        EmitHelper::write_highlighted(writer, context, &block.terminator.to_string(), highlight)?;
        context.dedent();
        Ok(())
    }

    fn emit_alias_table<W: Write>(
        &self,
        module: &Module,
        writer: &mut W,
        context: &mut EmitContext,
    ) -> EmitResult {
        EmitHelper::write_section(writer, context, "Alias classes")?;
        for (site, class) in module.alias_table() {
            let line = format!(
                "{}:{}:{} {}",
                site.function,
                site.block,
                site.index,
                describe_class(&module.layout, &class)
            );
            EmitHelper::write_line(writer, context, &line)?;
        }
        Ok(())
    }
}

impl Default for ModuleEmitter {
    fn default() -> Self {
        Self::new(EmitterConfig::default())
    }
}

fn instruction_highlight(inst: &Instruction) -> Highlight {
    match inst {
        Instruction::Load { .. } | Instruction::Store { .. } => Highlight::Memory,
        Instruction::Call { .. } => Highlight::Effect,
        Instruction::Opaque { .. } => Highlight::Warning,
        _ => Highlight::Plain,
    }
}

/// State accesses are named after the register they touch.
pub fn describe_class(layout: &StateLayout, class: &AliasClass) -> String {
    match class {
        AliasClass::StateField { offset, width } => {
            format!("{} ({})", class, layout.describe(*offset, *width))
        }
        _ => class.to_string(),
    }
}

impl Emitter for ModuleEmitter {
    type Item = Module;

    fn emit<W: Write>(&self, module: &Module, writer: &mut W, context: &mut EmitContext) -> EmitResult {
        EmitHelper::write_highlighted(writer, context, &format!("module {}", module.name), Highlight::Header)?;
        if self.config.verbosity.should_print_layout() {
            let layout = &module.layout;
            let comment = format!(
                "layout {}, {} bytes, {} fields",
                layout.name,
                layout.size,
                layout.fields.len()
            );
            EmitHelper::write_comment(writer, context, &comment)?;
            if let Some(image) = &module.image {
                for segment in &image.segments {
                    let comment = format!(
                        "segment {:#x}..{:#x} {}",
                        segment.base,
                        segment.end(),
                        if segment.writable { "rw" } else { "ro" }
                    );
                    EmitHelper::write_comment(writer, context, &comment)?;
                }
            }
        }

        for function in module.functions.values() {
            writeln!(writer)?;
            self.emit_function(function, writer, context)?;
        }

        if self.config.verbosity.should_print_alias_table() {
            self.emit_alias_table(module, writer, context)?;
        }
        Ok(())
    }

    fn emit_to_string(&self, module: &Module) -> Result<String> {
        let mut buffer = Vec::new();
        let mut context = EmitContext::from_config(&self.config);
        self.emit(module, &mut buffer, &mut context)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerbosityLevel;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use unvirt_core::{BinaryImage, FunctionBuilder, Value, Width};

    fn module() -> Module {
        let mut builder = FunctionBuilder::new("handler");
        let exit = builder.create_block_at(0x401010);
        let mut entry = builder.entry_block();
        let rax = entry.load_state(0, Width::W64);
        let sum = entry.add(rax, Value::konst(0x10, Width::W64), Width::W64);
        entry.store_state(8, sum, Width::W64);
        entry.jump(exit).unwrap();
        let mut exit_block = builder.block(exit).unwrap();
        exit_block.call_void(0x1000, vec![sum]);
        exit_block.ret().unwrap();

        let mut module = Module::new("sample", Arc::new(StateLayout::x86_64()))
            .with_image(BinaryImage::new().with_segment(0x400000, vec![0; 16], false));
        module.add_function(builder.build_unchecked());
        module
    }

    #[test]
    fn test_emit_plain_module() {
        let text = ModuleEmitter::new(EmitterConfig::plain())
            .emit_to_string(&module())
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "module sample");
        assert_eq!(lines[1], "; layout x86_64, 152 bytes, 24 fields");
        assert_eq!(lines[2], "; segment 0x400000..0x400010 ro");
        assert_eq!(lines[4], "function handler {");
        assert_eq!(lines[5], "  block0:  ; entry");
        assert!(lines[6].starts_with("    %") && lines[6].contains("= state_base"));
        assert!(text.contains("  block1:  ; at 0x401010\n"));
        assert!(text.contains("    call 0x1000("));
        assert_eq!(lines.last().copied(), Some("}"));
    }

    #[test]
    fn test_quiet_omits_layout() {
        let config = EmitterConfig::plain().with_verbosity(VerbosityLevel::Quiet);
        let text = ModuleEmitter::new(config).emit_to_string(&module()).unwrap();
        assert!(!text.contains("layout"));
        assert!(text.starts_with("module sample\n\nfunction handler {"));
    }

    #[test]
    fn test_debug_prints_alias_table() {
        let mut module = module();
        for function in module.functions.values_mut() {
            for block in function.blocks.values_mut() {
                for inst in &mut block.instructions {
                    if let Instruction::Load { class, .. } = inst {
                        *class = AliasClass::StateField { offset: 0, width: 8 };
                    }
                }
            }
        }
        let config = EmitterConfig::plain().with_verbosity(VerbosityLevel::Debug);
        let text = ModuleEmitter::new(config).emit_to_string(&module).unwrap();
        assert!(text.contains("=== Alias classes ==="));
        assert!(text.contains("state+0x0:8 (rax)"));
        assert!(text.contains("; 2 blocks,"));
    }

    #[test]
    fn test_describe_partial_register() {
        let layout = StateLayout::x86_64();
        let class = AliasClass::StateField { offset: 4, width: 4 };
        assert_eq!(describe_class(&layout, &class), "state+0x4:4 (rax+4)");
        assert_eq!(describe_class(&layout, &AliasClass::Heap), "heap");
    }
}
