use crate::analysis::alias::{AliasClass, Location};
use crate::analysis::memory::{lookup, transfer};
use crate::analysis::{AnalysisId, AnalysisManager, Facts};
use crate::block::Terminator;
use crate::config::ConcretizerConfig;
use crate::diagnostics::Diagnostic;
use crate::function::Function;
use crate::instructions::Instruction;
use crate::module::{BinaryImage, Module};
use crate::passes::utils::{remove_dead_instructions, remove_unreachable_blocks};
use crate::passes::{Pass, PassLedger};
use crate::values::{Constant, Value, ValueId};
use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Replaces provably single-valued expressions with literals and folds the
/// control flow they decide.
#[derive(Debug, Clone, Default)]
pub struct ConcretizePass {
    config: ConcretizerConfig,
    ledger: PassLedger,
}

impl ConcretizePass {
    pub fn new(config: ConcretizerConfig) -> Self {
        Self {
            config,
            ledger: PassLedger::default(),
        }
    }

    fn round(
        &mut self,
        function: &mut Function,
        image: Option<&BinaryImage>,
        analyses: &mut AnalysisManager,
    ) -> u64 {
        let cfg = analyses.control_flow(function);
        let facts = analyses.memory_facts(function);
        let name = function.name.clone();
        let mut rewrites = 0u64;

        for &block_id in cfg.reverse_postorder() {
            let mut state = facts.block_in(block_id).cloned().unwrap_or_default();
            let Some(block) = function.block_mut(block_id) else {
                continue;
            };

            let mut subst: HashMap<ValueId, Value> = HashMap::new();
            let mut written: Vec<Location> = Vec::new();
            let mut clobbered = false;
            let mut kept = Vec::with_capacity(block.instructions.len());

            for mut inst in std::mem::take(&mut block.instructions) {
                for operand in inst.operands_mut() {
                    if let Value::Var(id) = operand {
                        if let Some(replacement) = subst.get(id) {
                            *operand = *replacement;
                        }
                    }
                }

                if let Some(replacement) = self.evaluate(&inst, &state, image) {
                    if let Some(result) = inst.result() {
                        trace!(%block_id, %result, %replacement, "concretized");
                        subst.insert(result, replacement);
                        rewrites += 1;
                        continue;
                    }
                }

                if let Instruction::Load {
                    result,
                    class: class @ (AliasClass::StateField { .. } | AliasClass::Stack { .. }),
                    ..
                } = &inst
                {
                    if let Some(location) = class.location() {
                        let shadowed = clobbered || written.iter().any(|w| w.overlaps(&location));
                        if !shadowed && facts.is_conflicted(block_id, &location) {
                            self.ledger.record(Diagnostic::ConcretizationConflict {
                                function: name.clone(),
                                block: block_id,
                                value: *result,
                            });
                        }
                    }
                }

                match &inst {
                    Instruction::Store { class, .. } => match class.location() {
                        Some(location) => written.push(location),
                        None => clobbered |= *class == AliasClass::Unknown,
                    },
                    Instruction::Call { .. } | Instruction::Opaque { .. } => clobbered = true,
                    _ => {}
                }
                transfer(&mut state, &inst);
                kept.push(inst);
            }

            let Some(block) = function.block_mut(block_id) else {
                continue;
            };
            block.instructions = kept;

            if let Some(operand) = block.terminator.operand_mut() {
                if let Value::Var(id) = operand {
                    if let Some(replacement) = subst.get(id) {
                        *operand = *replacement;
                    }
                }
            }
            if let Some(Value::Const(c)) = block.terminator.operand() {
                if let Some(target) = block.terminator.resolve(c.bits) {
                    trace!(%block_id, %target, "folded terminator");
                    block.terminator = Terminator::Jump(target);
                    rewrites += 1;
                }
            }

            rewrites += remove_dead_instructions(block) as u64;
        }

        rewrites + remove_unreachable_blocks(function) as u64
    }

    /// The value an instruction is known to produce, if any.
    fn evaluate(
        &self,
        inst: &Instruction,
        state: &Facts,
        image: Option<&BinaryImage>,
    ) -> Option<Value> {
        if let Some(bits) = inst.fold() {
            let width = inst.result_width()?;
            return Some(Value::Const(Constant::new(bits, width)));
        }
        match inst {
            Instruction::Copy { value, .. } => Some(*value),
            Instruction::Select {
                cond: Value::Const(c),
                if_true,
                if_false,
                ..
            } => Some(if c.bits != 0 { *if_true } else { *if_false }),
            Instruction::Load { class, width, .. } if class.is_precise() => {
                let location = class.location()?;
                lookup(state, &location).map(|bits| Value::konst(bits, *width))
            }
            Instruction::Load {
                address: Value::Const(address),
                width,
                class: AliasClass::Heap,
                ..
            } if self.config.image_reads => {
                let bits = image?.read_constant(address.bits, width.bytes()?)?;
                Some(Value::konst(bits, *width))
            }
            _ => None,
        }
    }
}

impl Pass for ConcretizePass {
    fn name(&self) -> &'static str {
        "concretize"
    }

    fn run(&mut self, module: &mut Module, analyses: &mut AnalysisManager) -> Result<bool> {
        let mut total = 0u64;
        let image = module.image.clone();

        for function in module.functions.values_mut() {
            for round in 0..self.config.max_local_rounds {
                let rewrites = self.round(function, image.as_ref(), analyses);
                if rewrites == 0 {
                    break;
                }
                debug!(function = %function.name, round, rewrites, "concretization round");
                total += rewrites;
                analyses.invalidate(&function.name, &AnalysisId::ALL);
            }
        }

        self.ledger.count(total);
        Ok(total > 0)
    }

    fn required_analyses(&self) -> Vec<AnalysisId> {
        vec![AnalysisId::ControlFlow, AnalysisId::MemoryFacts]
    }

    fn take_ledger(&mut self) -> PassLedger {
        std::mem::take(&mut self.ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::instructions::CmpPred;
    use crate::layout::StateLayout;
    use crate::passes::ClassifyPass;
    use crate::types::Width;
    use std::sync::Arc;

    fn optimize(module: &mut Module) -> bool {
        let mut analyses = AnalysisManager::new();
        ClassifyPass::default().run(module, &mut analyses).unwrap();
        ConcretizePass::default().run(module, &mut analyses).unwrap()
    }

    #[test]
    fn test_forwarding_folds_branch() {
        let mut builder = FunctionBuilder::new("f");
        let taken = builder.create_block();
        let skipped = builder.create_block();

        let mut entry = builder.entry_block();
        entry.store_state(0, Value::konst(7, Width::W64), Width::W64);
        let rax = entry.load_state(0, Width::W64);
        let doubled = entry.add(rax, rax, Width::W64);
        let limit = entry.konst(14, Width::W64);
        let cond = entry.compare(CmpPred::Eq, doubled, limit, Width::W64);
        entry.branch(cond, taken, skipped).unwrap();

        let mut t = builder.block(taken).unwrap();
        t.call_void(0x1000, Vec::new());
        t.ret().unwrap();
        builder.block(skipped).unwrap().trap("never").unwrap();

        let mut module = Module::new("m", Arc::new(StateLayout::x86_64()));
        module.add_function(builder.build().unwrap());

        assert!(optimize(&mut module));
        let after = module.function("f").unwrap();

        assert_eq!(after.entry_block().terminator, Terminator::Jump(taken));
        assert!(after.block(skipped).is_none());
        assert!(after
            .entry_block()
            .instructions
            .iter()
            .all(|i| !matches!(i, Instruction::Load { .. } | Instruction::Compare { .. })));
    }

    #[test]
    fn test_disagreeing_predecessors_are_skipped() {
        let mut builder = FunctionBuilder::new("f");
        let left = builder.create_block();
        let right = builder.create_block();
        let join = builder.create_block();

        let mut entry = builder.entry_block();
        let rcx = entry.load_state(8, Width::W64);
        let zero = entry.konst(0, Width::W64);
        let cond = entry.compare(CmpPred::Eq, rcx, zero, Width::W64);
        entry.branch(cond, left, right).unwrap();

        let mut l = builder.block(left).unwrap();
        l.store_state(0, Value::konst(1, Width::W64), Width::W64);
        l.jump(join).unwrap();
        let mut r = builder.block(right).unwrap();
        r.store_state(0, Value::konst(2, Width::W64), Width::W64);
        r.jump(join).unwrap();

        let mut j = builder.block(join).unwrap();
        let rax = j.load_state(0, Width::W64);
        j.call_void(0x2000, vec![rax]);
        j.ret().unwrap();

        let mut module = Module::new("m", Arc::new(StateLayout::x86_64()));
        module.add_function(builder.build().unwrap());

        let mut analyses = AnalysisManager::new();
        ClassifyPass::default().run(&mut module, &mut analyses).unwrap();
        let mut pass = ConcretizePass::default();
        pass.run(&mut module, &mut analyses).unwrap();

        let join_block = module.function("f").unwrap().block(join).unwrap();
        assert!(join_block
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Load { .. })));
        let ledger = pass.take_ledger();
        assert!(ledger
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::ConcretizationConflict { block, .. } if *block == join)));
    }

    #[test]
    fn test_image_read_and_subrange() {
        let mut builder = FunctionBuilder::new("f");
        let mut entry = builder.entry_block();
        let table = entry.konst(0x4000, Width::W64);
        let word = entry.load(table, Width::W32);
        entry.store_state(16, Value::konst(0x1122_3344_5566_7788, Width::W64), Width::W64);
        let low = entry.load_state(16, Width::W16);
        entry.call_void(0x3000, vec![word, low]);
        entry.ret().unwrap();

        let mut module = Module::new("m", Arc::new(StateLayout::x86_64())).with_image(
            BinaryImage::new().with_segment(0x4000, vec![0xef, 0xbe, 0xad, 0xde], false),
        );
        module.add_function(builder.build().unwrap());
        assert!(optimize(&mut module));

        let entry = module.function("f").unwrap().entry_block();
        let call_args = entry.instructions.iter().find_map(|i| match i {
            Instruction::Call { args, .. } => Some(args.clone()),
            _ => None,
        });
        assert_eq!(
            call_args,
            Some(vec![
                Value::konst(0xdead_beef, Width::W32),
                Value::konst(0x7788, Width::W16)
            ])
        );
    }
}
