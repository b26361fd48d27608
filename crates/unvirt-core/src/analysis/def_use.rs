use crate::block::BlockId;
use crate::function::Function;
use crate::values::{Value, ValueId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Definition {
    pub block: BlockId,
    pub instruction: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseKind {
    Operand,
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub block: BlockId,
    /// Instruction index; for terminator uses this is the instruction count of the block.
    pub instruction: usize,
    pub kind: UseKind,
}

#[derive(Debug, Clone, Default)]
pub struct DefUseChains {
    definitions: HashMap<ValueId, Definition>,
    uses: HashMap<ValueId, Vec<Use>>,
}

impl DefUseChains {
    pub fn build(function: &Function) -> Self {
        let mut definitions = HashMap::new();
        let mut uses: HashMap<ValueId, Vec<Use>> = HashMap::new();

        for (&block_id, block) in &function.blocks {
            for (idx, inst) in block.instructions.iter().enumerate() {
                if let Some(result) = inst.result() {
                    definitions.insert(
                        result,
                        Definition {
                            block: block_id,
                            instruction: idx,
                        },
                    );
                }
                for operand in inst.operands() {
                    if let Value::Var(id) = operand {
                        uses.entry(id).or_default().push(Use {
                            block: block_id,
                            instruction: idx,
                            kind: UseKind::Operand,
                        });
                    }
                }
            }

            if let Some(Value::Var(id)) = block.terminator.operand() {
                uses.entry(id).or_default().push(Use {
                    block: block_id,
                    instruction: block.instructions.len(),
                    kind: UseKind::Terminator,
                });
            }
        }

        Self { definitions, uses }
    }

    pub fn definition(&self, value: ValueId) -> Option<Definition> {
        self.definitions.get(&value).copied()
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        self.uses.get(&value).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn use_count(&self, value: ValueId) -> usize {
        self.uses(value).len()
    }

    pub fn is_dead(&self, value: ValueId) -> bool {
        self.use_count(value) == 0
    }
}
