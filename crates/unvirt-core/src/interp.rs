/*! Concrete interpreter for lifted functions.
 *
 * Optimizations on protected code are only trustworthy if the rewritten function still does what
 * the lifted one did. The interpreter runs a function from an explicit machine state and records
 * every observable effect, so two versions of a function can be compared path by path. Addresses
 * are synthetic: the state structure and each frame live at fixed, far-apart bases and everything
 * else is heap, backed by the module's binary image.
 */

use crate::block::{BlockId, Terminator};
use crate::function::{FrameId, Function};
use crate::instructions::Instruction;
use crate::module::Module;
use crate::values::{Value, ValueId};
use crate::{IrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const STATE_BASE: u64 = 0x7fff_0000_0000_0000;
const FRAME_REGION: u64 = 0x7ffe_0000_0000_0000;
const FRAME_STRIDE: u64 = 0x1_0000_0000;
const FRAME_BIAS: u64 = 0x8000_0000;

pub fn frame_base(frame: FrameId) -> u64 {
    FRAME_REGION + u64::from(frame.0) * FRAME_STRIDE + FRAME_BIAS
}

enum Cell {
    State(usize),
    Frame(FrameId, i64),
    Heap(u64),
}

fn decode(address: u64, state_size: usize) -> Cell {
    if address >= STATE_BASE && address - STATE_BASE < state_size as u64 {
        return Cell::State((address - STATE_BASE) as usize);
    }
    if (FRAME_REGION..STATE_BASE).contains(&address) {
        let index = (address - FRAME_REGION) / FRAME_STRIDE;
        let frame = FrameId(index as u32);
        let offset = address as i64 - frame_base(frame) as i64;
        return Cell::Frame(frame, offset);
    }
    Cell::Heap(address)
}

/// Memory seen by an execution. Heap bytes never written read from the image, then zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineState {
    pub state: Vec<u8>,
    pub frames: BTreeMap<FrameId, BTreeMap<i64, u8>>,
    pub heap: BTreeMap<u64, u8>,
}

impl MachineState {
    pub fn new(state_size: u32) -> Self {
        Self {
            state: vec![0; state_size as usize],
            frames: BTreeMap::new(),
            heap: BTreeMap::new(),
        }
    }

    pub fn for_module(module: &Module) -> Self {
        Self::new(module.layout.size)
    }

    /// Write a little-endian value of `bytes` bytes into the state structure.
    pub fn set_state(&mut self, offset: u32, bytes: u8, value: u64) {
        for i in 0..bytes as usize {
            if let Some(slot) = self.state.get_mut(offset as usize + i) {
                *slot = (value >> (i * 8)) as u8;
            }
        }
    }

    pub fn read_state(&self, offset: u32, bytes: u8) -> u64 {
        (0..bytes as usize).rev().fold(0u64, |acc, i| {
            let byte = self.state.get(offset as usize + i).copied().unwrap_or(0);
            (acc << 8) | u64::from(byte)
        })
    }

    pub fn set_frame(&mut self, frame: FrameId, offset: i64, bytes: u8, value: u64) {
        let slots = self.frames.entry(frame).or_default();
        for i in 0..i64::from(bytes) {
            slots.insert(offset + i, (value >> (i * 8)) as u8);
        }
    }

    fn read_byte(&self, address: u64, module: &Module) -> u8 {
        match decode(address, self.state.len()) {
            Cell::State(i) => self.state[i],
            Cell::Frame(frame, offset) => self
                .frames
                .get(&frame)
                .and_then(|m| m.get(&offset))
                .copied()
                .unwrap_or(0),
            Cell::Heap(address) => self.heap.get(&address).copied().unwrap_or_else(|| {
                module
                    .image
                    .as_ref()
                    .and_then(|image| image.read_byte(address))
                    .unwrap_or(0)
            }),
        }
    }

    fn write_byte(&mut self, address: u64, byte: u8) {
        match decode(address, self.state.len()) {
            Cell::State(i) => self.state[i] = byte,
            Cell::Frame(frame, offset) => {
                self.frames.entry(frame).or_default().insert(offset, byte);
            }
            Cell::Heap(address) => {
                self.heap.insert(address, byte);
            }
        }
    }

    pub fn read(&self, address: u64, bytes: u8, module: &Module) -> u64 {
        (0..u64::from(bytes)).rev().fold(0u64, |acc, i| {
            (acc << 8) | u64::from(self.read_byte(address.wrapping_add(i), module))
        })
    }

    pub fn write(&mut self, address: u64, bytes: u8, value: u64) {
        for i in 0..u64::from(bytes) {
            self.write_byte(address.wrapping_add(i), (value >> (i * 8)) as u8);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Call { target: u64, args: Vec<u64> },
    Opaque { address: u64 },
    Trap(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Returned,
    Trapped(String),
    StepLimit,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub effects: Vec<Effect>,
    pub path: Vec<BlockId>,
    pub state: MachineState,
    pub steps: usize,
    /// Values computed per `(block, value)`, when recording is enabled.
    pub observed: HashMap<(BlockId, ValueId), Vec<u64>>,
}

impl Execution {
    /// Effects and final memory, the parts two equivalent functions must agree on.
    pub fn observable(&self) -> (&Outcome, &[Effect], &MachineState) {
        (&self.outcome, &self.effects, &self.state)
    }
}

pub struct Interpreter<'m> {
    module: &'m Module,
    step_limit: usize,
    record_values: bool,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            step_limit: 100_000,
            record_values: false,
        }
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_value_recording(mut self) -> Self {
        self.record_values = true;
        self
    }

    pub fn run(&self, function: &str, state: MachineState) -> Result<Execution> {
        let function = self.module.function(function)?;
        self.run_function(function, state)
    }

    pub fn run_function(&self, function: &Function, mut state: MachineState) -> Result<Execution> {
        let mut effects = Vec::new();
        let mut path = Vec::new();
        let mut observed: HashMap<(BlockId, ValueId), Vec<u64>> = HashMap::new();
        let mut steps = 0usize;
        let mut current = function.entry;

        let outcome = 'run: loop {
            let block = function.require_block(current)?;
            path.push(current);
            let mut values: HashMap<ValueId, u64> = HashMap::new();

            for inst in &block.instructions {
                steps += 1;
                if steps > self.step_limit {
                    break 'run Outcome::StepLimit;
                }

                let read = |value: &Value| -> Result<u64> {
                    match value {
                        Value::Const(c) => Ok(c.bits),
                        Value::Var(id) => values.get(id).copied().ok_or_else(|| {
                            IrError::Interpreter(format!("{} read before definition in {}", id, current))
                        }),
                    }
                };

                let result = match inst {
                    Instruction::Binary {
                        op, lhs, rhs, width, ..
                    } => Some(op.eval(read(lhs)?, read(rhs)?, *width)),
                    Instruction::Unary {
                        op, operand, width, ..
                    } => Some(op.eval(read(operand)?, *width)),
                    Instruction::Compare {
                        pred, lhs, rhs, width, ..
                    } => Some(u64::from(pred.eval(read(lhs)?, read(rhs)?, *width))),
                    Instruction::Cast {
                        kind, operand, from, to, ..
                    } => Some(kind.eval(read(operand)?, *from, *to)),
                    Instruction::Select {
                        cond,
                        if_true,
                        if_false,
                        width,
                        ..
                    } => {
                        let chosen = if read(cond)? != 0 { if_true } else { if_false };
                        Some(width.truncate(read(chosen)?))
                    }
                    Instruction::Copy { value, width, .. } => Some(width.truncate(read(value)?)),
                    Instruction::StateBase { .. } => Some(STATE_BASE),
                    Instruction::FrameBase { frame, .. } => Some(frame_base(*frame)),
                    Instruction::PtrAdd { base, offset, .. } => {
                        Some(read(base)?.wrapping_add(read(offset)?))
                    }
                    Instruction::Load { address, width, .. } => {
                        let bytes = width.bytes().unwrap_or(1);
                        Some(state.read(read(address)?, bytes, self.module))
                    }
                    Instruction::Store {
                        address,
                        value,
                        width,
                        ..
                    } => {
                        let bytes = width.bytes().unwrap_or(1);
                        let (address, value) = (read(address)?, read(value)?);
                        state.write(address, bytes, value);
                        None
                    }
                    Instruction::Call { target, args, result } => {
                        let args = args.iter().map(&read).collect::<Result<Vec<_>>>()?;
                        effects.push(Effect::Call {
                            target: *target,
                            args,
                        });
                        result.map(|_| 0)
                    }
                    Instruction::Opaque { address, .. } => {
                        effects.push(Effect::Opaque { address: *address });
                        None
                    }
                };

                if let (Some(id), Some(value)) = (inst.result(), result) {
                    if self.record_values {
                        observed.entry((current, id)).or_default().push(value);
                    }
                    values.insert(id, value);
                }
            }

            steps += 1;
            if steps > self.step_limit {
                break 'run Outcome::StepLimit;
            }

            let operand = match block.terminator.operand() {
                Some(Value::Const(c)) => c.bits,
                Some(Value::Var(id)) => values.get(&id).copied().ok_or_else(|| {
                    IrError::Interpreter(format!("{} read before definition in {}", id, current))
                })?,
                None => 0,
            };

            match &block.terminator {
                Terminator::Return => break 'run Outcome::Returned,
                Terminator::Trap(reason) => {
                    effects.push(Effect::Trap(reason.clone()));
                    break 'run Outcome::Trapped(reason.clone());
                }
                term => {
                    current = term.resolve(operand).ok_or_else(|| {
                        IrError::Interpreter(format!("{} has no successor", current))
                    })?;
                }
            }
        };

        Ok(Execution {
            outcome,
            effects,
            path,
            state,
            steps,
            observed,
        })
    }
}
