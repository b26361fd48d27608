use crate::analysis::alias::AliasClass;
use crate::function::FrameId;
use crate::types::Width;
use crate::values::{Value, ValueId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 9] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Shl,
        BinaryOp::LShr,
        BinaryOp::AShr,
    ];

    /// Shift amounts at or beyond the width produce zero, or the sign fill for `AShr`.
    pub fn eval(self, lhs: u64, rhs: u64, width: Width) -> u64 {
        let lhs = width.truncate(lhs);
        let rhs = width.truncate(rhs);
        let bits = u64::from(width.bits());
        let result = match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
            BinaryOp::Shl => {
                if rhs >= bits {
                    0
                } else {
                    lhs << rhs
                }
            }
            BinaryOp::LShr => {
                if rhs >= bits {
                    0
                } else {
                    lhs >> rhs
                }
            }
            BinaryOp::AShr => {
                let signed = width.sign_extend(lhs);
                if rhs >= bits {
                    if signed < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else {
                    (signed >> rhs) as u64
                }
            }
        };
        width.truncate(result)
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::LShr => "lshr",
            BinaryOp::AShr => "ashr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub fn eval(self, operand: u64, width: Width) -> u64 {
        match self {
            UnaryOp::Not => width.truncate(!operand),
            UnaryOp::Neg => width.truncate(operand.wrapping_neg()),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "neg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
    Sle,
}

impl CmpPred {
    pub fn eval(self, lhs: u64, rhs: u64, width: Width) -> bool {
        let (ul, ur) = (width.truncate(lhs), width.truncate(rhs));
        let (sl, sr) = (width.sign_extend(lhs), width.sign_extend(rhs));
        match self {
            CmpPred::Eq => ul == ur,
            CmpPred::Ne => ul != ur,
            CmpPred::Ult => ul < ur,
            CmpPred::Ule => ul <= ur,
            CmpPred::Slt => sl < sr,
            CmpPred::Sle => sl <= sr,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Ult => "ult",
            CmpPred::Ule => "ule",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    ZExt,
    SExt,
    Trunc,
}

impl CastKind {
    pub fn eval(self, operand: u64, from: Width, to: Width) -> u64 {
        match self {
            CastKind::ZExt => to.truncate(from.truncate(operand)),
            CastKind::SExt => to.truncate(from.sign_extend(operand) as u64),
            CastKind::Trunc => to.truncate(operand),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CastKind::ZExt => "zext",
            CastKind::SExt => "sext",
            CastKind::Trunc => "trunc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Binary {
        op: BinaryOp,
        result: ValueId,
        lhs: Value,
        rhs: Value,
        width: Width,
    },
    Unary {
        op: UnaryOp,
        result: ValueId,
        operand: Value,
        width: Width,
    },
    Compare {
        pred: CmpPred,
        result: ValueId,
        lhs: Value,
        rhs: Value,
        width: Width,
    },
    Cast {
        kind: CastKind,
        result: ValueId,
        operand: Value,
        from: Width,
        to: Width,
    },
    Select {
        result: ValueId,
        cond: Value,
        if_true: Value,
        if_false: Value,
        width: Width,
    },
    Copy {
        result: ValueId,
        value: Value,
        width: Width,
    },

    StateBase {
        result: ValueId,
    },
    FrameBase {
        result: ValueId,
        frame: FrameId,
    },
    PtrAdd {
        result: ValueId,
        base: Value,
        offset: Value,
    },

    Load {
        result: ValueId,
        address: Value,
        width: Width,
        #[serde(default = "AliasClass::unknown")]
        class: AliasClass,
    },
    Store {
        address: Value,
        value: Value,
        width: Width,
        #[serde(default = "AliasClass::unknown")]
        class: AliasClass,
    },

    Call {
        result: Option<ValueId>,
        target: u64,
        args: Vec<Value>,
    },
    Opaque {
        address: u64,
        bytes: Vec<u8>,
        reason: String,
    },
}

impl Instruction {
    pub fn result(&self) -> Option<ValueId> {
        match self {
            Instruction::Binary { result, .. }
            | Instruction::Unary { result, .. }
            | Instruction::Compare { result, .. }
            | Instruction::Cast { result, .. }
            | Instruction::Select { result, .. }
            | Instruction::Copy { result, .. }
            | Instruction::StateBase { result }
            | Instruction::FrameBase { result, .. }
            | Instruction::PtrAdd { result, .. }
            | Instruction::Load { result, .. } => Some(*result),
            Instruction::Call { result, .. } => *result,
            Instruction::Store { .. } | Instruction::Opaque { .. } => None,
        }
    }

    pub fn result_mut(&mut self) -> Option<&mut ValueId> {
        match self {
            Instruction::Binary { result, .. }
            | Instruction::Unary { result, .. }
            | Instruction::Compare { result, .. }
            | Instruction::Cast { result, .. }
            | Instruction::Select { result, .. }
            | Instruction::Copy { result, .. }
            | Instruction::StateBase { result }
            | Instruction::FrameBase { result, .. }
            | Instruction::PtrAdd { result, .. }
            | Instruction::Load { result, .. } => Some(result),
            Instruction::Call { result, .. } => result.as_mut(),
            Instruction::Store { .. } | Instruction::Opaque { .. } => None,
        }
    }

    /// Width of the defined value, if any. Pointers are 64 bits wide.
    pub fn result_width(&self) -> Option<Width> {
        match self {
            Instruction::Binary { width, .. }
            | Instruction::Unary { width, .. }
            | Instruction::Select { width, .. }
            | Instruction::Copy { width, .. }
            | Instruction::Load { width, .. } => Some(*width),
            Instruction::Compare { .. } => Some(Width::W1),
            Instruction::Cast { to, .. } => Some(*to),
            Instruction::StateBase { .. }
            | Instruction::FrameBase { .. }
            | Instruction::PtrAdd { .. } => Some(Width::W64),
            Instruction::Call { result, .. } => result.map(|_| Width::W64),
            Instruction::Store { .. } | Instruction::Opaque { .. } => None,
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Instruction::Binary { lhs, rhs, .. } | Instruction::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            Instruction::Unary { operand, .. } | Instruction::Cast { operand, .. } => {
                vec![*operand]
            }
            Instruction::Select {
                cond,
                if_true,
                if_false,
                ..
            } => vec![*cond, *if_true, *if_false],
            Instruction::Copy { value, .. } => vec![*value],
            Instruction::StateBase { .. } | Instruction::FrameBase { .. } => Vec::new(),
            Instruction::PtrAdd { base, offset, .. } => vec![*base, *offset],
            Instruction::Load { address, .. } => vec![*address],
            Instruction::Store { address, value, .. } => vec![*address, *value],
            Instruction::Call { args, .. } => args.clone(),
            Instruction::Opaque { .. } => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Instruction::Binary { lhs, rhs, .. } | Instruction::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Instruction::Unary { operand, .. } | Instruction::Cast { operand, .. } => {
                vec![operand]
            }
            Instruction::Select {
                cond,
                if_true,
                if_false,
                ..
            } => vec![cond, if_true, if_false],
            Instruction::Copy { value, .. } => vec![value],
            Instruction::StateBase { .. } | Instruction::FrameBase { .. } => Vec::new(),
            Instruction::PtrAdd { base, offset, .. } => vec![base, offset],
            Instruction::Load { address, .. } => vec![address],
            Instruction::Store { address, value, .. } => vec![address, value],
            Instruction::Call { args, .. } => args.iter_mut().collect(),
            Instruction::Opaque { .. } => Vec::new(),
        }
    }

    /// Pure instructions have no effect besides defining their result.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Instruction::Binary { .. }
                | Instruction::Unary { .. }
                | Instruction::Compare { .. }
                | Instruction::Cast { .. }
                | Instruction::Select { .. }
                | Instruction::Copy { .. }
                | Instruction::StateBase { .. }
                | Instruction::FrameBase { .. }
                | Instruction::PtrAdd { .. }
        )
    }

    /// Loads are kept alive when unused only if their removal could hide a fault;
    /// lifted loads from classified memory are removable.
    pub fn is_removable_when_dead(&self) -> bool {
        self.is_pure() || matches!(self, Instruction::Load { class, .. } if class.is_precise())
    }

    pub fn alias_class(&self) -> Option<AliasClass> {
        match self {
            Instruction::Load { class, .. } | Instruction::Store { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Evaluate a pure arithmetic instruction whose operands are all literals.
    pub fn fold(&self) -> Option<u64> {
        match self {
            Instruction::Binary {
                op,
                lhs: Value::Const(l),
                rhs: Value::Const(r),
                width,
                ..
            } => Some(op.eval(l.bits, r.bits, *width)),
            Instruction::Unary {
                op,
                operand: Value::Const(c),
                width,
                ..
            } => Some(op.eval(c.bits, *width)),
            Instruction::Compare {
                pred,
                lhs: Value::Const(l),
                rhs: Value::Const(r),
                width,
                ..
            } => Some(u64::from(pred.eval(l.bits, r.bits, *width))),
            Instruction::Cast {
                kind,
                operand: Value::Const(c),
                from,
                to,
                ..
            } => Some(kind.eval(c.bits, *from, *to)),
            Instruction::Select {
                cond: Value::Const(c),
                if_true,
                if_false,
                ..
            } => {
                let chosen = if c.bits != 0 { if_true } else { if_false };
                chosen.as_const().map(|k| k.bits)
            }
            Instruction::Copy {
                value: Value::Const(c),
                ..
            } => Some(c.bits),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Binary {
                op,
                result,
                lhs,
                rhs,
                width,
            } => write!(f, "{} = {}.{} {}, {}", result, op.mnemonic(), width, lhs, rhs),
            Instruction::Unary {
                op,
                result,
                operand,
                width,
            } => write!(f, "{} = {}.{} {}", result, op.mnemonic(), width, operand),
            Instruction::Compare {
                pred,
                result,
                lhs,
                rhs,
                width,
            } => write!(
                f,
                "{} = icmp.{}.{} {}, {}",
                result,
                pred.mnemonic(),
                width,
                lhs,
                rhs
            ),
            Instruction::Cast {
                kind,
                result,
                operand,
                from,
                to,
            } => write!(
                f,
                "{} = {} {} {} to {}",
                result,
                kind.mnemonic(),
                from,
                operand,
                to
            ),
            Instruction::Select {
                result,
                cond,
                if_true,
                if_false,
                width,
            } => write!(
                f,
                "{} = select.{} {}, {}, {}",
                result, width, cond, if_true, if_false
            ),
            Instruction::Copy {
                result,
                value,
                width,
            } => write!(f, "{} = copy.{} {}", result, width, value),
            Instruction::StateBase { result } => write!(f, "{} = state_base", result),
            Instruction::FrameBase { result, frame } => {
                write!(f, "{} = frame_base {}", result, frame)
            }
            Instruction::PtrAdd {
                result,
                base,
                offset,
            } => write!(f, "{} = ptradd {}, {}", result, base, offset),
            Instruction::Load {
                result,
                address,
                width,
                class,
            } => write!(f, "{} = load.{} {} [{}]", result, width, address, class),
            Instruction::Store {
                address,
                value,
                width,
                class,
            } => write!(f, "store.{} {}, {} [{}]", width, value, address, class),
            Instruction::Call {
                result,
                target,
                args,
            } => {
                if let Some(result) = result {
                    write!(f, "{} = ", result)?;
                }
                write!(f, "call {:#x}(", target)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Instruction::Opaque {
                address,
                bytes,
                reason,
            } => write!(
                f,
                "opaque @{:#x} ({} bytes): {}",
                address,
                bytes.len(),
                reason
            ),
        }
    }
}
