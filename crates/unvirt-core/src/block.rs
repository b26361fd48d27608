use crate::instructions::Instruction;
use crate::values::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Guest address of the first lifted instruction.
    #[serde(default)]
    pub address: Option<u64>,
    /// Block this one was cloned from by node splitting.
    #[serde(default)]
    pub origin: Option<BlockId>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            address: None,
            origin: None,
            instructions: Vec::new(),
            terminator: Terminator::Trap("unterminated".to_string()),
        }
    }

    pub fn add_instruction(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    pub fn set_terminator(&mut self, term: Terminator) {
        self.terminator = term;
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }

    /// The block this one ultimately descends from.
    pub fn root_origin(&self) -> BlockId {
        self.origin.unwrap_or(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Cases are tried in order; the first matching literal wins.
    Switch {
        selector: Value,
        cases: Vec<(u64, BlockId)>,
        default: BlockId,
    },
    Return,
    Trap(String),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Switch { cases, default, .. } => {
                let mut succs: Vec<BlockId> = cases.iter().map(|(_, block)| *block).collect();
                succs.push(*default);
                succs
            }
            Terminator::Return | Terminator::Trap(_) => Vec::new(),
        }
    }

    pub fn operand(&self) -> Option<Value> {
        match self {
            Terminator::Branch { cond, .. } => Some(*cond),
            Terminator::Switch { selector, .. } => Some(*selector),
            _ => None,
        }
    }

    pub fn operand_mut(&mut self) -> Option<&mut Value> {
        match self {
            Terminator::Branch { cond, .. } => Some(cond),
            Terminator::Switch { selector, .. } => Some(selector),
            _ => None,
        }
    }

    /// Redirect every edge to `from` towards `to`. Returns whether anything changed.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) -> bool {
        let mut changed = false;
        let mut swap = |target: &mut BlockId| {
            if *target == from {
                *target = to;
                changed = true;
            }
        };
        match self {
            Terminator::Jump(target) => swap(target),
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                swap(then_block);
                swap(else_block);
            }
            Terminator::Switch { cases, default, .. } => {
                for (_, block) in cases.iter_mut() {
                    swap(block);
                }
                swap(default);
            }
            Terminator::Return | Terminator::Trap(_) => {}
        }
        changed
    }

    /// The successor taken when the condition or selector is the literal `value`.
    pub fn resolve(&self, value: u64) -> Option<BlockId> {
        match self {
            Terminator::Jump(target) => Some(*target),
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => Some(if value != 0 { *then_block } else { *else_block }),
            Terminator::Switch { cases, default, .. } => Some(
                cases
                    .iter()
                    .find(|(case, _)| *case == value)
                    .map(|(_, block)| *block)
                    .unwrap_or(*default),
            ),
            Terminator::Return | Terminator::Trap(_) => None,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Terminator::Branch { .. } | Terminator::Switch { .. })
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jump {}", target),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "br {}, {}, {}", cond, then_block, else_block),
            Terminator::Switch {
                selector,
                cases,
                default,
            } => {
                write!(f, "switch {} [", selector)?;
                for (i, (value, block)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:#x} => {}", value, block)?;
                }
                write!(f, "] default {}", default)
            }
            Terminator::Return => write!(f, "ret"),
            Terminator::Trap(reason) => write!(f, "trap \"{}\"", reason),
        }
    }
}
