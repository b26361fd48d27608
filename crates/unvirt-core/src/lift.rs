/*! Lifting driver.
 *
 * Instruction semantics come from an external provider that turns one machine instruction into a
 * short IR fragment. The driver strings fragments together into blocks, renumbers their values into
 * the function arena, and wires block exits by guest address once every block is known. An
 * instruction the provider cannot model does not stop lifting: it becomes an opaque effect that
 * clobbers memory, and precision degrades gracefully around it.
 */

use crate::block::{BlockId, Terminator};
use crate::diagnostics::Diagnostic;
use crate::function::Function;
use crate::instructions::Instruction;
use crate::values::{Value, ValueId};
use crate::{IrError, Result};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiftError {
    #[error("Unsupported instruction at {address:#x}")]
    UnsupportedInstruction { address: u64, length: Option<usize> },
    #[error("Truncated instruction at {address:#x}")]
    Truncated { address: u64 },
    #[error("Invalid fragment at {address:#x}: {message}")]
    InvalidFragment { address: u64, message: String },
}

/// How control leaves a lifted instruction, by guest address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentExit {
    Jump(u64),
    Branch {
        cond: Value,
        taken: u64,
        not_taken: u64,
    },
    Switch {
        selector: Value,
        cases: Vec<(u64, u64)>,
        default: u64,
    },
    Return,
    Trap(String),
}

/// The IR for one machine instruction. Values are numbered locally from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFragment {
    pub length: usize,
    pub instructions: Vec<Instruction>,
    pub terminator: Option<FragmentExit>,
}

impl IrFragment {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            instructions: Vec::new(),
            terminator: None,
        }
    }

    pub fn with_instruction(mut self, inst: Instruction) -> Self {
        self.instructions.push(inst);
        self
    }

    pub fn with_exit(mut self, exit: FragmentExit) -> Self {
        self.terminator = Some(exit);
        self
    }
}

pub trait SemanticsProvider {
    fn lift(&self, address: u64, bytes: &[u8]) -> std::result::Result<IrFragment, LiftError>;
}

pub struct Lifter<'p, P: SemanticsProvider + ?Sized> {
    provider: &'p P,
    blocks_by_address: HashMap<u64, BlockId>,
    exits: Vec<(BlockId, FragmentExit)>,
    fallthroughs: Vec<(BlockId, u64)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'p, P: SemanticsProvider + ?Sized> Lifter<'p, P> {
    pub fn new(provider: &'p P) -> Self {
        Self {
            provider,
            blocks_by_address: HashMap::new(),
            exits: Vec::new(),
            fallthroughs: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Lift a straight run of instructions starting at `address` into a new block.
    pub fn lift_block(&mut self, function: &mut Function, address: u64, bytes: &[u8]) -> Result<BlockId> {
        let block_id = if self.blocks_by_address.is_empty()
            && function.entry_block().instructions.is_empty()
            && function.entry_block().address.is_none()
        {
            function.entry
        } else {
            function.create_block()
        };
        self.blocks_by_address.insert(address, block_id);

        let mut instructions = Vec::new();
        let mut offset = 0usize;
        let mut exit = None;

        while offset < bytes.len() {
            let pc = address + offset as u64;
            match self.provider.lift(pc, &bytes[offset..]) {
                Ok(fragment) => {
                    if fragment.length == 0 || offset + fragment.length > bytes.len() {
                        return Err(LiftError::Truncated { address: pc }.into());
                    }
                    let mut renumber = HashMap::new();
                    for inst in fragment.instructions {
                        instructions.push(remap(function, inst, &mut renumber, pc)?);
                    }
                    offset += fragment.length;
                    if let Some(fragment_exit) = fragment.terminator {
                        exit = Some(remap_exit(fragment_exit, &renumber, pc)?);
                        break;
                    }
                }
                Err(LiftError::UnsupportedInstruction { length, .. }) => {
                    let skip = length.unwrap_or(1).clamp(1, bytes.len() - offset);
                    warn!(address = pc, skip, "unsupported instruction, emitting opaque effect");
                    instructions.push(Instruction::Opaque {
                        address: pc,
                        bytes: bytes[offset..offset + skip].to_vec(),
                        reason: "unsupported instruction".to_string(),
                    });
                    self.diagnostics.push(Diagnostic::SemanticsGap { address: pc });
                    offset += skip;
                }
                Err(other) => return Err(other.into()),
            }
        }

        let block = function.require_block_mut(block_id)?;
        block.address = Some(address);
        block.instructions = instructions;
        block.terminator = Terminator::Trap("fallthrough".to_string());

        match exit {
            Some(exit) => self.exits.push((block_id, exit)),
            None => self.fallthroughs.push((block_id, address + offset as u64)),
        }
        debug!(%block_id, address, length = offset, "lifted block");
        Ok(block_id)
    }

    /// Resolve every recorded exit to the block lifted at its target address.
    /// Targets that were never lifted become traps.
    pub fn link(&mut self, function: &mut Function) -> Result<()> {
        let resolve = |blocks: &HashMap<u64, BlockId>, target: u64| blocks.get(&target).copied();

        for (block_id, exit) in std::mem::take(&mut self.exits) {
            let terminator = match exit {
                FragmentExit::Return => Terminator::Return,
                FragmentExit::Trap(reason) => Terminator::Trap(reason),
                FragmentExit::Jump(target) => match resolve(&self.blocks_by_address, target) {
                    Some(block) => Terminator::Jump(block),
                    None => Terminator::Trap(format!("unlifted target {:#x}", target)),
                },
                FragmentExit::Branch {
                    cond,
                    taken,
                    not_taken,
                } => match (
                    resolve(&self.blocks_by_address, taken),
                    resolve(&self.blocks_by_address, not_taken),
                ) {
                    (Some(then_block), Some(else_block)) => Terminator::Branch {
                        cond,
                        then_block,
                        else_block,
                    },
                    _ => Terminator::Trap(format!(
                        "unlifted branch target {:#x}/{:#x}",
                        taken, not_taken
                    )),
                },
                FragmentExit::Switch {
                    selector,
                    cases,
                    default,
                } => {
                    let resolved: Option<Vec<(u64, BlockId)>> = cases
                        .iter()
                        .map(|(value, target)| {
                            resolve(&self.blocks_by_address, *target).map(|b| (*value, b))
                        })
                        .collect();
                    match (resolved, resolve(&self.blocks_by_address, default)) {
                        (Some(cases), Some(default)) => Terminator::Switch {
                            selector,
                            cases,
                            default,
                        },
                        _ => Terminator::Trap("unlifted switch target".to_string()),
                    }
                }
            };
            function.require_block_mut(block_id)?.terminator = terminator;
        }

        for (block_id, next) in std::mem::take(&mut self.fallthroughs) {
            if let Some(target) = resolve(&self.blocks_by_address, next) {
                function.require_block_mut(block_id)?.terminator = Terminator::Jump(target);
            }
        }
        Ok(())
    }

    pub fn block_at(&self, address: u64) -> Option<BlockId> {
        self.blocks_by_address.get(&address).copied()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

fn remap(
    function: &mut Function,
    mut inst: Instruction,
    renumber: &mut HashMap<ValueId, ValueId>,
    address: u64,
) -> Result<Instruction> {
    for operand in inst.operands_mut() {
        if let Value::Var(local) = operand {
            let fresh = renumber.get(local).copied().ok_or_else(|| {
                IrError::Lift(LiftError::InvalidFragment {
                    address,
                    message: format!("{} used before definition", local),
                })
            })?;
            *operand = Value::Var(fresh);
        }
    }
    if let Some(result) = inst.result_mut() {
        let fresh = function.new_value();
        renumber.insert(*result, fresh);
        *result = fresh;
    }
    Ok(inst)
}

fn remap_exit(
    exit: FragmentExit,
    renumber: &HashMap<ValueId, ValueId>,
    address: u64,
) -> Result<FragmentExit> {
    let remap_value = |value: Value| -> Result<Value> {
        match value {
            Value::Var(local) => renumber.get(&local).map(|v| Value::Var(*v)).ok_or_else(|| {
                IrError::Lift(LiftError::InvalidFragment {
                    address,
                    message: format!("exit uses undefined {}", local),
                })
            }),
            constant => Ok(constant),
        }
    };
    Ok(match exit {
        FragmentExit::Branch {
            cond,
            taken,
            not_taken,
        } => FragmentExit::Branch {
            cond: remap_value(cond)?,
            taken,
            not_taken,
        },
        FragmentExit::Switch {
            selector,
            cases,
            default,
        } => FragmentExit::Switch {
            selector: remap_value(selector)?,
            cases,
            default,
        },
        other => other,
    })
}
