use crate::analysis::alias::{AliasClass, PointerTracker};
use crate::analysis::{AnalysisId, AnalysisManager};
use crate::config::ClassifierConfig;
use crate::diagnostics::Diagnostic;
use crate::instructions::Instruction;
use crate::layout::StateLayout;
use crate::module::Module;
use crate::passes::{Pass, PassLedger};
use anyhow::Result;
use tracing::{debug, warn};

/// Tags every load and store with the memory region it provably touches.
#[derive(Debug, Clone, Default)]
pub struct ClassifyPass {
    config: ClassifierConfig,
    ledger: PassLedger,
}

impl ClassifyPass {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            ledger: PassLedger::default(),
        }
    }

    fn classify_access(
        &self,
        tracker: &PointerTracker,
        layout: &StateLayout,
        inst: &Instruction,
    ) -> Option<AliasClass> {
        let (address, width) = match inst {
            Instruction::Load { address, width, .. } | Instruction::Store { address, width, .. } => {
                (*address, *width)
            }
            _ => return None,
        };
        let Some(bytes) = width.bytes() else {
            return Some(AliasClass::Unknown);
        };
        let class = tracker
            .resolve(address)
            .map_or(AliasClass::Unknown, |pointer| pointer.classify(layout, bytes));

        if let AliasClass::StateField { offset, width } = class {
            if self.config.field_aligned {
                let inside_field = layout
                    .field_at(offset)
                    .is_some_and(|f| offset + u32::from(width) <= f.end());
                if !inside_field {
                    return Some(AliasClass::Unknown);
                }
            }
        }
        Some(class)
    }
}

impl Pass for ClassifyPass {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn run(&mut self, module: &mut Module, _analyses: &mut AnalysisManager) -> Result<bool> {
        let layout = module.layout.clone();
        let mut refined = 0u64;

        for (name, function) in module.functions.iter_mut() {
            for (block_id, block) in function.blocks.iter_mut() {
                let mut tracker = PointerTracker::new();
                for (index, inst) in block.instructions.iter_mut().enumerate() {
                    if let Some(computed) = self.classify_access(&tracker, &layout, inst) {
                        if computed == AliasClass::Unknown {
                            self.ledger.record(Diagnostic::ClassificationAmbiguity {
                                function: name.clone(),
                                block: *block_id,
                                index,
                            });
                        }

                        let cached = inst.alias_class().unwrap_or(AliasClass::Unknown);
                        let (class, conflict) = cached.refine(computed);
                        if conflict {
                            warn!(
                                function = %name,
                                block = %block_id,
                                index,
                                %cached,
                                %computed,
                                "refusing to widen alias class"
                            );
                        }
                        if class != cached {
                            if let Instruction::Load { class: slot, .. }
                            | Instruction::Store { class: slot, .. } = inst
                            {
                                *slot = class;
                            }
                            refined += 1;
                        }
                    }
                    tracker.observe(inst);
                }
            }
        }

        self.ledger.count(refined);
        debug!(refined, "classification finished");
        Ok(refined > 0)
    }

    fn invalidated_analyses(&self) -> Vec<AnalysisId> {
        vec![AnalysisId::MemoryFacts]
    }

    fn take_ledger(&mut self) -> PassLedger {
        std::mem::take(&mut self.ledger)
    }
}
