/*! Fluent API for constructing lifted IR by hand.
 *
 * Semantics providers, tests and fixtures all need to write blocks of IR. The builders allocate
 * value ids from the function arena, pick result widths, and keep instruction order, so callers
 * only describe the machine effects.
 */

use crate::analysis::alias::AliasClass;
use crate::block::{BlockId, Terminator};
use crate::function::{FrameId, Function};
use crate::instructions::{BinaryOp, CastKind, CmpPred, Instruction, UnaryOp};
use crate::types::Width;
use crate::values::{Value, ValueId};
use crate::verify::verify_function;
use crate::{IrError, Result};

pub struct FunctionBuilder {
    function: Function,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            function: Function::new(name),
        }
    }

    pub fn entry(&self) -> BlockId {
        self.function.entry
    }

    pub fn create_block(&mut self) -> BlockId {
        self.function.create_block()
    }

    pub fn create_block_at(&mut self, address: u64) -> BlockId {
        let id = self.function.create_block();
        if let Some(block) = self.function.block_mut(id) {
            block.address = Some(address);
        }
        id
    }

    pub fn new_frame(&mut self) -> FrameId {
        self.function.new_frame()
    }

    pub fn entry_block(&mut self) -> BlockBuilder<'_> {
        let entry = self.function.entry;
        BlockBuilder {
            function: &mut self.function,
            block: entry,
        }
    }

    pub fn block(&mut self, block: BlockId) -> Result<BlockBuilder<'_>> {
        if !self.function.blocks.contains_key(&block) {
            return Err(IrError::BlockNotFound(block));
        }
        Ok(BlockBuilder {
            function: &mut self.function,
            block,
        })
    }

    pub fn current_function(&self) -> &Function {
        &self.function
    }

    /// Finish the function after checking it is well formed.
    pub fn build(self) -> Result<Function> {
        verify_function(&self.function)?;
        Ok(self.function)
    }

    /// Finish without verification, for fixtures that are malformed on purpose.
    pub fn build_unchecked(self) -> Function {
        self.function
    }
}

pub struct BlockBuilder<'a> {
    function: &'a mut Function,
    block: BlockId,
}

impl<'a> BlockBuilder<'a> {
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    fn push(&mut self, inst: Instruction) {
        if let Some(block) = self.function.block_mut(self.block) {
            block.add_instruction(inst);
        }
    }

    fn define(&mut self, build: impl FnOnce(ValueId) -> Instruction) -> Value {
        let result = self.function.new_value();
        let inst = build(result);
        self.push(inst);
        Value::Var(result)
    }

    pub fn konst(&self, bits: u64, width: Width) -> Value {
        Value::konst(bits, width)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value, width: Width) -> Value {
        self.define(|result| Instruction::Binary {
            op,
            result,
            lhs,
            rhs,
            width,
        })
    }

    pub fn add(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Add, lhs, rhs, width)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Sub, lhs, rhs, width)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Mul, lhs, rhs, width)
    }

    pub fn and(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::And, lhs, rhs, width)
    }

    pub fn or(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Or, lhs, rhs, width)
    }

    pub fn xor(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Xor, lhs, rhs, width)
    }

    pub fn shl(&mut self, lhs: Value, rhs: Value, width: Width) -> Value {
        self.binary(BinaryOp::Shl, lhs, rhs, width)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Value, width: Width) -> Value {
        self.define(|result| Instruction::Unary {
            op,
            result,
            operand,
            width,
        })
    }

    pub fn not(&mut self, operand: Value, width: Width) -> Value {
        self.unary(UnaryOp::Not, operand, width)
    }

    pub fn neg(&mut self, operand: Value, width: Width) -> Value {
        self.unary(UnaryOp::Neg, operand, width)
    }

    pub fn compare(&mut self, pred: CmpPred, lhs: Value, rhs: Value, width: Width) -> Value {
        self.define(|result| Instruction::Compare {
            pred,
            result,
            lhs,
            rhs,
            width,
        })
    }

    pub fn cast(&mut self, kind: CastKind, operand: Value, from: Width, to: Width) -> Value {
        self.define(|result| Instruction::Cast {
            kind,
            result,
            operand,
            from,
            to,
        })
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value, width: Width) -> Value {
        self.define(|result| Instruction::Select {
            result,
            cond,
            if_true,
            if_false,
            width,
        })
    }

    pub fn copy(&mut self, value: Value, width: Width) -> Value {
        self.define(|result| Instruction::Copy {
            result,
            value,
            width,
        })
    }

    pub fn state_base(&mut self) -> Value {
        self.define(|result| Instruction::StateBase { result })
    }

    pub fn frame_base(&mut self, frame: FrameId) -> Value {
        self.define(|result| Instruction::FrameBase { result, frame })
    }

    pub fn ptr_add(&mut self, base: Value, offset: i64) -> Value {
        let offset = Value::konst(offset as u64, Width::W64);
        self.define(|result| Instruction::PtrAdd {
            result,
            base,
            offset,
        })
    }

    /// Address of `state + offset`.
    pub fn state_ptr(&mut self, offset: i64) -> Value {
        let base = self.state_base();
        self.ptr_add(base, offset)
    }

    pub fn load(&mut self, address: Value, width: Width) -> Value {
        self.define(|result| Instruction::Load {
            result,
            address,
            width,
            class: AliasClass::Unknown,
        })
    }

    pub fn store(&mut self, address: Value, value: Value, width: Width) {
        self.push(Instruction::Store {
            address,
            value,
            width,
            class: AliasClass::Unknown,
        });
    }

    pub fn load_state(&mut self, offset: i64, width: Width) -> Value {
        let address = self.state_ptr(offset);
        self.load(address, width)
    }

    pub fn store_state(&mut self, offset: i64, value: Value, width: Width) {
        let address = self.state_ptr(offset);
        self.store(address, value, width);
    }

    pub fn call(&mut self, target: u64, args: Vec<Value>) -> Value {
        self.define(|result| Instruction::Call {
            result: Some(result),
            target,
            args,
        })
    }

    pub fn call_void(&mut self, target: u64, args: Vec<Value>) {
        self.push(Instruction::Call {
            result: None,
            target,
            args,
        });
    }

    pub fn opaque(&mut self, address: u64, bytes: Vec<u8>, reason: impl Into<String>) {
        self.push(Instruction::Opaque {
            address,
            bytes,
            reason: reason.into(),
        });
    }

    fn terminate(&mut self, term: Terminator) -> Result<()> {
        self.function
            .require_block_mut(self.block)?
            .set_terminator(term);
        Ok(())
    }

    pub fn jump(&mut self, target: BlockId) -> Result<()> {
        self.terminate(Terminator::Jump(target))
    }

    pub fn branch(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) -> Result<()> {
        self.terminate(Terminator::Branch {
            cond,
            then_block,
            else_block,
        })
    }

    pub fn switch(
        &mut self,
        selector: Value,
        cases: Vec<(u64, BlockId)>,
        default: BlockId,
    ) -> Result<()> {
        self.terminate(Terminator::Switch {
            selector,
            cases,
            default,
        })
    }

    pub fn ret(&mut self) -> Result<()> {
        self.terminate(Terminator::Return)
    }

    pub fn trap(&mut self, reason: impl Into<String>) -> Result<()> {
        self.terminate(Terminator::Trap(reason.into()))
    }
}
