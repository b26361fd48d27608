use crate::{IrError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit width of an IR value. Arithmetic wraps modulo `2^bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Width(u8);

impl Width {
    pub const W1: Width = Width(1);
    pub const W8: Width = Width(8);
    pub const W16: Width = Width(16);
    pub const W32: Width = Width(32);
    pub const W64: Width = Width(64);

    pub fn new(bits: u32) -> Result<Self> {
        match bits {
            1 | 8 | 16 | 32 | 64 => Ok(Width(bits as u8)),
            other => Err(IrError::InvalidWidth(other)),
        }
    }

    pub fn from_bytes(bytes: u8) -> Result<Self> {
        Self::new(u32::from(bytes) * 8)
    }

    pub fn bits(self) -> u32 {
        u32::from(self.0)
    }

    /// Byte size of a memory access of this width. `W1` has no memory form.
    pub fn bytes(self) -> Option<u8> {
        if self.0 % 8 == 0 {
            Some(self.0 / 8)
        } else {
            None
        }
    }

    pub fn mask(self) -> u64 {
        if self.0 >= 64 {
            u64::MAX
        } else {
            (1u64 << self.0) - 1
        }
    }

    pub fn truncate(self, bits: u64) -> u64 {
        bits & self.mask()
    }

    pub fn sign_bit(self) -> u64 {
        1u64 << (self.0 - 1)
    }

    /// Interpret `bits` as a two's complement number of this width.
    pub fn sign_extend(self, bits: u64) -> i64 {
        let bits = self.truncate(bits);
        if self.0 >= 64 {
            bits as i64
        } else if bits & self.sign_bit() != 0 {
            (bits | !self.mask()) as i64
        } else {
            bits as i64
        }
    }
}

impl TryFrom<u8> for Width {
    type Error = IrError;

    fn try_from(bits: u8) -> Result<Self> {
        Width::new(u32::from(bits))
    }
}

impl From<Width> for u8 {
    fn from(width: Width) -> u8 {
        width.0
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_validation() {
        assert!(Width::new(32).is_ok());
        assert!(Width::new(12).is_err());
        assert_eq!(Width::from_bytes(2).unwrap(), Width::W16);
        assert_eq!(Width::W1.bytes(), None);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(Width::W8.sign_extend(0xff), -1);
        assert_eq!(Width::W8.sign_extend(0x7f), 127);
        assert_eq!(Width::W64.sign_extend(u64::MAX), -1);
        assert_eq!(Width::W16.truncate(0x1_2345), 0x2345);
    }
}
