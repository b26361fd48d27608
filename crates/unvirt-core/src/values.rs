use crate::types::Width;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A literal. `bits` is always stored truncated to `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Constant {
    pub bits: u64,
    pub width: Width,
}

impl Constant {
    pub fn new(bits: u64, width: Width) -> Self {
        Self {
            bits: width.truncate(bits),
            width,
        }
    }

    pub fn signed(&self) -> i64 {
        self.width.sign_extend(self.bits)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bits < 10 {
            write!(f, "{}:{}", self.bits, self.width)
        } else {
            write!(f, "{:#x}:{}", self.bits, self.width)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Var(ValueId),
    Const(Constant),
}

impl Value {
    pub fn konst(bits: u64, width: Width) -> Self {
        Value::Const(Constant::new(bits, width))
    }

    pub fn as_var(&self) -> Option<ValueId> {
        match self {
            Value::Var(id) => Some(*id),
            Value::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<Constant> {
        match self {
            Value::Const(c) => Some(*c),
            Value::Var(_) => None,
        }
    }
}

impl From<ValueId> for Value {
    fn from(id: ValueId) -> Self {
        Value::Var(id)
    }
}

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        Value::Const(c)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Var(id) => write!(f, "{}", id),
            Value::Const(c) => write!(f, "{}", c),
        }
    }
}
