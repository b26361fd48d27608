use crate::function::Function;
use crate::instructions::Instruction;
use crate::module::Module;
use crate::types::Width;
use crate::values::{Value, ValueId};
use crate::{IrError, Result};
use std::collections::{HashMap, HashSet};

/// Check that `function` is structurally well formed.
pub fn verify_function(function: &Function) -> Result<()> {
    let fail = |message: String| IrError::Verification {
        function: function.name.clone(),
        message,
    };

    if !function.blocks.contains_key(&function.entry) {
        return Err(fail(format!("entry {} does not exist", function.entry)));
    }

    let mut defined_anywhere: HashSet<ValueId> = HashSet::new();

    for (block_id, block) in &function.blocks {
        if block.id != *block_id {
            return Err(fail(format!("{} is stored under {}", block.id, block_id)));
        }

        let mut local: HashMap<ValueId, Width> = HashMap::new();

        for (index, inst) in block.instructions.iter().enumerate() {
            let at = |message: String| fail(format!("{}:{}: {}", block_id, index, message));

            let width_of = |value: &Value| -> std::result::Result<Width, String> {
                match value {
                    Value::Const(c) => Ok(c.width),
                    Value::Var(id) => local
                        .get(id)
                        .copied()
                        .ok_or_else(|| format!("{} used before definition", id)),
                }
            };
            let expect = |value: &Value, width: Width| -> std::result::Result<(), String> {
                let actual = width_of(value)?;
                if actual != width {
                    Err(format!("{} has width {}, expected {}", value, actual, width))
                } else {
                    Ok(())
                }
            };

            let checked: std::result::Result<(), String> = match inst {
                Instruction::Binary {
                    lhs, rhs, width, ..
                }
                | Instruction::Compare {
                    lhs, rhs, width, ..
                } => expect(lhs, *width).and_then(|_| expect(rhs, *width)),
                Instruction::Unary { operand, width, .. } => expect(operand, *width),
                Instruction::Cast {
                    operand, from, ..
                } => expect(operand, *from),
                Instruction::Select {
                    cond,
                    if_true,
                    if_false,
                    width,
                    ..
                } => expect(cond, Width::W1)
                    .and_then(|_| expect(if_true, *width))
                    .and_then(|_| expect(if_false, *width)),
                Instruction::Copy { value, width, .. } => expect(value, *width),
                Instruction::StateBase { .. } | Instruction::FrameBase { .. } => Ok(()),
                Instruction::PtrAdd { base, offset, .. } => {
                    expect(base, Width::W64).and_then(|_| expect(offset, Width::W64))
                }
                Instruction::Load { address, width, .. } => {
                    if width.bytes().is_none() {
                        Err(format!("memory access of width {}", width))
                    } else {
                        expect(address, Width::W64)
                    }
                }
                Instruction::Store {
                    address,
                    value,
                    width,
                    ..
                } => {
                    if width.bytes().is_none() {
                        Err(format!("memory access of width {}", width))
                    } else {
                        expect(address, Width::W64).and_then(|_| expect(value, *width))
                    }
                }
                Instruction::Call { args, .. } => args.iter().try_for_each(|a| width_of(a).map(|_| ())),
                Instruction::Opaque { .. } => Ok(()),
            };
            checked.map_err(at)?;

            if let Some(result) = inst.result() {
                if !defined_anywhere.insert(result) {
                    return Err(at(format!("{} defined more than once", result)));
                }
                if let Some(width) = inst.result_width() {
                    local.insert(result, width);
                }
            }
        }

        if let Some(Value::Var(id)) = block.terminator.operand() {
            if !local.contains_key(&id) {
                return Err(fail(format!(
                    "{}: terminator uses {} before definition",
                    block_id, id
                )));
            }
        }
        for target in block.terminator.successors() {
            if !function.blocks.contains_key(&target) {
                return Err(fail(format!(
                    "{} branches to missing {}",
                    block_id, target
                )));
            }
        }
    }

    Ok(())
}

pub fn verify_module(module: &Module) -> Result<()> {
    for function in module.functions.values() {
        verify_function(function)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Terminator;
    use crate::builder::FunctionBuilder;
    use crate::instructions::BinaryOp;

    #[test]
    fn test_cross_block_use_rejected() {
        let mut builder = FunctionBuilder::new("f");
        let next = builder.create_block();
        let mut entry = builder.entry_block();
        let v = entry.load_state(0, Width::W64);
        entry.jump(next).unwrap();
        let mut next_block = builder.block(next).unwrap();
        next_block.store_state(8, v, Width::W64);
        next_block.ret().unwrap();

        let err = verify_function(builder.current_function()).unwrap_err();
        assert!(err.to_string().contains("used before definition"));
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let mut func = Function::new("f");
        let entry = func.entry;
        let a = func.new_value();
        let b = func.new_value();
        let block = func.block_mut(entry).unwrap();
        block.add_instruction(Instruction::Copy {
            result: a,
            value: Value::konst(1, Width::W32),
            width: Width::W32,
        });
        block.add_instruction(Instruction::Binary {
            op: BinaryOp::Add,
            result: b,
            lhs: Value::Var(a),
            rhs: Value::konst(1, Width::W64),
            width: Width::W64,
        });
        block.set_terminator(Terminator::Return);

        assert!(verify_function(&func).is_err());
    }

    #[test]
    fn test_double_definition_rejected() {
        let mut func = Function::new("f");
        let entry = func.entry;
        let block = func.block_mut(entry).unwrap();
        for _ in 0..2 {
            block.add_instruction(Instruction::StateBase { result: ValueId(0) });
        }
        block.set_terminator(Terminator::Return);
        let err = verify_function(&func).unwrap_err();
        assert!(err.to_string().contains("defined more than once"));
    }
}
