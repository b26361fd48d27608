use crate::function::FrameId;
use crate::instructions::{BinaryOp, Instruction};
use crate::layout::StateLayout;
use crate::values::{Value, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Static partition of memory accesses. Widths are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AliasClass {
    StateField { offset: u32, width: u8 },
    Stack { frame: FrameId, offset: i64, width: u8 },
    Heap,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    MustAlias,
    MayAlias,
    NoAlias,
}

impl AliasClass {
    pub fn unknown() -> Self {
        AliasClass::Unknown
    }

    /// Precise classes name one exact byte range.
    pub fn is_precise(&self) -> bool {
        matches!(self, AliasClass::StateField { .. } | AliasClass::Stack { .. })
    }

    pub fn location(&self) -> Option<Location> {
        match *self {
            AliasClass::StateField { offset, width } => Some(Location {
                region: Region::State,
                offset: i64::from(offset),
                width,
            }),
            AliasClass::Stack {
                frame,
                offset,
                width,
            } => Some(Location {
                region: Region::Frame(frame),
                offset,
                width,
            }),
            AliasClass::Heap | AliasClass::Unknown => None,
        }
    }

    pub fn alias(&self, other: &AliasClass) -> AliasResult {
        match (self, other) {
            (AliasClass::Unknown, _) | (_, AliasClass::Unknown) => AliasResult::MayAlias,
            (AliasClass::Heap, AliasClass::Heap) => AliasResult::MayAlias,
            (AliasClass::Heap, _) | (_, AliasClass::Heap) => AliasResult::NoAlias,
            _ => match (self.location(), other.location()) {
                (Some(a), Some(b)) if a == b => AliasResult::MustAlias,
                (Some(a), Some(b)) if a.overlaps(&b) => AliasResult::MayAlias,
                _ => AliasResult::NoAlias,
            },
        }
    }

    /// Combine a cached tag with a freshly computed one. Tags only refine: once
    /// precise, a tag is kept. Returns the tag to store and whether the new
    /// result conflicted with a precise cached tag.
    pub fn refine(self, computed: AliasClass) -> (AliasClass, bool) {
        if self.is_precise() {
            return (self, computed != self);
        }
        match (self, computed) {
            (AliasClass::Heap, AliasClass::Unknown) => (self, true),
            (_, computed) => (computed, false),
        }
    }
}

impl fmt::Display for AliasClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasClass::StateField { offset, width } => write!(f, "state+{:#x}:{}", offset, width),
            AliasClass::Stack {
                frame,
                offset,
                width,
            } => write!(f, "{}{:+}:{}", frame, offset, width),
            AliasClass::Heap => write!(f, "heap"),
            AliasClass::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    State,
    Frame(FrameId),
}

/// A precise byte range inside the state structure or a stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub region: Region,
    pub offset: i64,
    pub width: u8,
}

impl Location {
    pub fn end(&self) -> i64 {
        self.offset + i64::from(self.width)
    }

    pub fn overlaps(&self, other: &Location) -> bool {
        self.region == other.region && self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &Location) -> bool {
        self.region == other.region && self.offset <= other.offset && other.end() <= self.end()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Region::State => write!(f, "state{:+}:{}", self.offset, self.width),
            Region::Frame(frame) => write!(f, "{}{:+}:{}", frame, self.offset, self.width),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerRoot {
    State,
    Frame(FrameId),
    Absolute,
}

/// A pointer decomposed as `root + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinePointer {
    pub root: PointerRoot,
    pub offset: i64,
}

impl AffinePointer {
    pub fn classify(&self, layout: &StateLayout, width: u8) -> AliasClass {
        match self.root {
            PointerRoot::State => {
                if layout.contains(self.offset, width) {
                    AliasClass::StateField {
                        offset: self.offset as u32,
                        width,
                    }
                } else {
                    AliasClass::Unknown
                }
            }
            PointerRoot::Frame(frame) => AliasClass::Stack {
                frame,
                offset: self.offset,
                width,
            },
            PointerRoot::Absolute => AliasClass::Heap,
        }
    }
}

/// Affine base tracking over the pure definitions of one block.
#[derive(Debug, Default)]
pub struct PointerTracker {
    pointers: HashMap<ValueId, AffinePointer>,
}

impl PointerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, value: Value) -> Option<AffinePointer> {
        match value {
            Value::Const(c) => Some(AffinePointer {
                root: PointerRoot::Absolute,
                offset: c.bits as i64,
            }),
            Value::Var(id) => self.pointers.get(&id).copied(),
        }
    }

    pub fn observe(&mut self, inst: &Instruction) {
        let tracked = match inst {
            Instruction::StateBase { result } => Some((
                *result,
                AffinePointer {
                    root: PointerRoot::State,
                    offset: 0,
                },
            )),
            Instruction::FrameBase { result, frame } => Some((
                *result,
                AffinePointer {
                    root: PointerRoot::Frame(*frame),
                    offset: 0,
                },
            )),
            Instruction::PtrAdd {
                result,
                base,
                offset,
            } => self.offset_by(*base, *offset, 1).map(|p| (*result, p)),
            Instruction::Binary {
                op: BinaryOp::Add,
                result,
                lhs,
                rhs,
                width,
            } if width.bits() == 64 => self
                .offset_by(*lhs, *rhs, 1)
                .or_else(|| self.offset_by(*rhs, *lhs, 1))
                .map(|p| (*result, p)),
            Instruction::Binary {
                op: BinaryOp::Sub,
                result,
                lhs,
                rhs,
                width,
            } if width.bits() == 64 => self.offset_by(*lhs, *rhs, -1).map(|p| (*result, p)),
            Instruction::Copy { result, value, .. } => self.resolve(*value).map(|p| (*result, p)),
            _ => None,
        };
        if let Some((result, pointer)) = tracked {
            self.pointers.insert(result, pointer);
        }
    }

    fn offset_by(&self, base: Value, offset: Value, sign: i64) -> Option<AffinePointer> {
        let base = match base {
            Value::Var(id) => *self.pointers.get(&id)?,
            Value::Const(_) => return None,
        };
        let delta = offset.as_const()?.signed();
        Some(AffinePointer {
            root: base.root,
            offset: base.offset.wrapping_add(sign.wrapping_mul(delta)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(offset: u32, width: u8) -> AliasClass {
        AliasClass::StateField { offset, width }
    }

    #[test]
    fn test_alias_queries() {
        assert_eq!(state(0, 8).alias(&state(0, 8)), AliasResult::MustAlias);
        assert_eq!(state(0, 8).alias(&state(4, 4)), AliasResult::MayAlias);
        assert_eq!(state(0, 8).alias(&state(8, 8)), AliasResult::NoAlias);
        assert_eq!(state(0, 8).alias(&AliasClass::Heap), AliasResult::NoAlias);
        assert_eq!(AliasClass::Heap.alias(&AliasClass::Heap), AliasResult::MayAlias);
        assert_eq!(state(0, 8).alias(&AliasClass::Unknown), AliasResult::MayAlias);

        let frame = AliasClass::Stack {
            frame: FrameId(0),
            offset: 0,
            width: 8,
        };
        assert_eq!(frame.alias(&state(0, 8)), AliasResult::NoAlias);
    }

    #[test]
    fn test_refine_never_widens() {
        let precise = state(16, 8);
        assert_eq!(precise.refine(AliasClass::Unknown), (precise, true));
        assert_eq!(precise.refine(state(24, 8)), (precise, true));
        assert_eq!(precise.refine(precise), (precise, false));
        assert_eq!(AliasClass::Unknown.refine(precise), (precise, false));
        assert_eq!(AliasClass::Heap.refine(AliasClass::Unknown), (AliasClass::Heap, true));
    }

    #[test]
    fn test_location_overlap() {
        let a = Location {
            region: Region::State,
            offset: 0,
            width: 8,
        };
        let b = Location {
            region: Region::State,
            offset: 4,
            width: 2,
        };
        assert!(a.overlaps(&b));
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
    }
}
