use crate::instructions::{BinaryOp, UnaryOp};
use crate::types::Width;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pure expression tree at a single width, used to exchange fragments with
/// synthesis backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Input(usize),
    Const(u64),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary(op, Box::new(operand))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn eval(&self, inputs: &[u64], width: Width) -> u64 {
        match self {
            Expr::Input(i) => width.truncate(inputs.get(*i).copied().unwrap_or(0)),
            Expr::Const(c) => width.truncate(*c),
            Expr::Unary(op, operand) => op.eval(operand.eval(inputs, width), width),
            Expr::Binary(op, lhs, rhs) => {
                op.eval(lhs.eval(inputs, width), rhs.eval(inputs, width), width)
            }
        }
    }

    pub fn op_cost(op: BinaryOp) -> u32 {
        match op {
            BinaryOp::Mul => 4,
            BinaryOp::Shl | BinaryOp::LShr | BinaryOp::AShr => 2,
            _ => 1,
        }
    }

    pub fn cost(&self) -> u32 {
        match self {
            Expr::Input(_) | Expr::Const(_) => 0,
            Expr::Unary(_, operand) => 1 + operand.cost(),
            Expr::Binary(op, lhs, rhs) => Self::op_cost(*op) + lhs.cost() + rhs.cost(),
        }
    }

    /// Number of operator nodes.
    pub fn size(&self) -> usize {
        match self {
            Expr::Input(_) | Expr::Const(_) => 0,
            Expr::Unary(_, operand) => 1 + operand.size(),
            Expr::Binary(_, lhs, rhs) => 1 + lhs.size() + rhs.size(),
        }
    }

    pub fn constants(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.collect_constants(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_constants(&self, out: &mut Vec<u64>) {
        match self {
            Expr::Input(_) => {}
            Expr::Const(c) => out.push(*c),
            Expr::Unary(_, operand) => operand.collect_constants(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_constants(out);
                rhs.collect_constants(out);
            }
        }
    }

    /// Number of inputs referenced, i.e. one past the highest input index.
    pub fn arity(&self) -> usize {
        match self {
            Expr::Input(i) => i + 1,
            Expr::Const(_) => 0,
            Expr::Unary(_, operand) => operand.arity(),
            Expr::Binary(_, lhs, rhs) => lhs.arity().max(rhs.arity()),
        }
    }

    /// Built only from `And`/`Or`/`Xor`/`Not`, inputs and constants.
    pub fn is_bitwise(&self) -> bool {
        match self {
            Expr::Input(_) | Expr::Const(_) => true,
            Expr::Unary(UnaryOp::Not, operand) => operand.is_bitwise(),
            Expr::Unary(UnaryOp::Neg, _) => false,
            Expr::Binary(op, lhs, rhs) => op.is_bitwise() && lhs.is_bitwise() && rhs.is_bitwise(),
        }
    }

    /// Mask every constant to `width`.
    pub fn normalized(&self, width: Width) -> Expr {
        match self {
            Expr::Input(i) => Expr::Input(*i),
            Expr::Const(c) => Expr::Const(width.truncate(*c)),
            Expr::Unary(op, operand) => Expr::unary(*op, operand.normalized(width)),
            Expr::Binary(op, lhs, rhs) => {
                Expr::binary(*op, lhs.normalized(width), rhs.normalized(width))
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Input(i) => write!(f, "x{}", i),
            Expr::Const(c) => {
                if *c < 10 {
                    write!(f, "{}", c)
                } else {
                    write!(f, "{:#x}", c)
                }
            }
            Expr::Unary(op, operand) => write!(f, "({} {})", op.mnemonic(), operand),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", op.mnemonic(), lhs, rhs),
        }
    }
}
