use crate::block::{BasicBlock, BlockId};
use crate::instructions::Instruction;
use crate::types::Width;
use crate::values::{Value, ValueId};
use crate::{IrError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A virtual stack frame rooted at a `FrameBase` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub entry: BlockId,
    pub blocks: IndexMap<BlockId, BasicBlock>,
    #[serde(default)]
    next_block: u32,
    #[serde(default)]
    next_value: u32,
    #[serde(default)]
    next_frame: u32,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        let entry = BlockId(0);
        let mut blocks = IndexMap::new();
        blocks.insert(entry, BasicBlock::new(entry));
        Self {
            name: name.into(),
            entry,
            blocks,
            next_block: 1,
            next_value: 0,
            next_frame: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(id, BasicBlock::new(id));
        id
    }

    pub fn new_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn new_frame(&mut self) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn require_block(&self, id: BlockId) -> Result<&BasicBlock> {
        self.blocks.get(&id).ok_or(IrError::BlockNotFound(id))
    }

    pub fn require_block_mut(&mut self, id: BlockId) -> Result<&mut BasicBlock> {
        self.blocks.get_mut(&id).ok_or(IrError::BlockNotFound(id))
    }

    pub fn remove_block(&mut self, id: BlockId) -> Option<BasicBlock> {
        self.blocks.shift_remove(&id)
    }

    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[&self.entry]
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    /// Width of `value` as seen from `block`. Values are block-local, so only
    /// `block` is searched for the definition.
    pub fn value_width(&self, block: BlockId, value: Value) -> Option<Width> {
        match value {
            Value::Const(c) => Some(c.width),
            Value::Var(id) => self.blocks.get(&block).and_then(|b| {
                b.instructions
                    .iter()
                    .find(|inst| inst.result() == Some(id))
                    .and_then(Instruction::result_width)
            }),
        }
    }

    /// Restore the id counters after deserialization so fresh ids never collide.
    pub fn reindex(&mut self) {
        let max_block = self.blocks.keys().map(|b| b.0 + 1).max().unwrap_or(0);
        let mut max_value = 0;
        let mut max_frame = 0;
        for inst in self.blocks.values().flat_map(|b| &b.instructions) {
            if let Some(result) = inst.result() {
                max_value = max_value.max(result.0 + 1);
            }
            for operand in inst.operands() {
                if let Value::Var(id) = operand {
                    max_value = max_value.max(id.0 + 1);
                }
            }
            if let Instruction::FrameBase { frame, .. } = inst {
                max_frame = max_frame.max(frame.0 + 1);
            }
        }
        self.next_block = self.next_block.max(max_block);
        self.next_value = self.next_value.max(max_value);
        self.next_frame = self.next_frame.max(max_frame);
    }
}
