/*! Machine state layout.
 *
 * Lifted code keeps guest registers and flags in one fixed aggregate whose base is produced by
 * `StateBase`. The layout names the byte ranges of that aggregate so the classifier can turn a
 * `state + 0x88` access into a precise field tag. The layout is process-wide: it is installed once
 * and shared read-only by every module afterwards.
 */

use crate::{IrError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

static GLOBAL_LAYOUT: OnceLock<Arc<StateLayout>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Register,
    Flag,
    ProgramCounter,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    pub offset: u32,
    /// Size in bytes.
    pub width: u8,
    pub kind: FieldKind,
}

impl StateField {
    pub fn new(name: impl Into<String>, offset: u32, width: u8, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
            kind,
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + u32::from(self.width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    pub name: String,
    pub size: u32,
    pub fields: Vec<StateField>,
}

impl StateLayout {
    pub fn new(name: impl Into<String>, size: u32, mut fields: Vec<StateField>) -> Result<Self> {
        fields.sort_by_key(|f| f.offset);
        let layout = Self {
            name: name.into(),
            size,
            fields,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<&StateField> = None;
        let mut sorted: Vec<&StateField> = self.fields.iter().collect();
        sorted.sort_by_key(|f| f.offset);

        for field in sorted {
            if !matches!(field.width, 1 | 2 | 4 | 8) {
                return Err(IrError::InvalidLayout(format!(
                    "field {} has width {}",
                    field.name, field.width
                )));
            }
            if field.end() > self.size {
                return Err(IrError::InvalidLayout(format!(
                    "field {} ends at {} past size {}",
                    field.name,
                    field.end(),
                    self.size
                )));
            }
            if let Some(prev) = previous {
                if prev.end() > field.offset {
                    return Err(IrError::InvalidLayout(format!(
                        "fields {} and {} overlap",
                        prev.name, field.name
                    )));
                }
            }
            previous = Some(field);
        }
        Ok(())
    }

    /// The stock x86-64 layout: 16 GPRs, RIP, RFLAGS and byte-sized status flags.
    pub fn x86_64() -> Self {
        const GPRS: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        const FLAGS: [&str; 6] = ["cf", "pf", "af", "zf", "sf", "of"];

        let mut fields: Vec<StateField> = GPRS
            .iter()
            .enumerate()
            .map(|(i, name)| StateField::new(*name, (i * 8) as u32, 8, FieldKind::Register))
            .collect();
        fields.push(StateField::new("rip", 128, 8, FieldKind::ProgramCounter));
        fields.push(StateField::new("rflags", 136, 8, FieldKind::Register));
        fields.extend(
            FLAGS
                .iter()
                .enumerate()
                .map(|(i, name)| StateField::new(*name, 144 + i as u32, 1, FieldKind::Flag)),
        );

        Self {
            name: "x86_64".to_string(),
            size: 152,
            fields,
        }
    }

    /// Install the process-wide layout. Fails if one is already installed.
    pub fn install_global(layout: StateLayout) -> Result<Arc<StateLayout>> {
        layout.validate()?;
        let layout = Arc::new(layout);
        GLOBAL_LAYOUT
            .set(layout.clone())
            .map_err(|_| IrError::LayoutAlreadyInstalled)?;
        Ok(layout)
    }

    pub fn global() -> Option<Arc<StateLayout>> {
        GLOBAL_LAYOUT.get().cloned()
    }

    /// The installed layout, or the x86-64 layout installed on first use.
    pub fn global_or_default() -> Arc<StateLayout> {
        GLOBAL_LAYOUT
            .get_or_init(|| Arc::new(StateLayout::x86_64()))
            .clone()
    }

    pub fn field_at(&self, offset: u32) -> Option<&StateField> {
        self.fields
            .iter()
            .find(|f| f.offset <= offset && offset < f.end())
    }

    pub fn field_named(&self, name: &str) -> Option<&StateField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether `[offset, offset + width)` lies inside the structure.
    pub fn contains(&self, offset: i64, width: u8) -> bool {
        offset >= 0 && offset + i64::from(width) <= i64::from(self.size)
    }

    /// Human-readable name for an access, e.g. `rax` or `rax+4`.
    pub fn describe(&self, offset: u32, width: u8) -> String {
        match self.field_at(offset) {
            Some(field) if field.offset == offset && field.width == width => field.name.clone(),
            Some(field) => format!("{}+{}", field.name, offset - field.offset),
            None => format!("state+{:#x}", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_layout_is_valid() {
        let layout = StateLayout::x86_64();
        assert!(layout.validate().is_ok());
        assert_eq!(layout.field_named("rip").unwrap().offset, 128);
        assert_eq!(layout.field_at(148).unwrap().name, "sf");
        assert_eq!(layout.describe(4, 4), "rax+4");
        assert!(layout.contains(144, 8));
        assert!(!layout.contains(148, 8));
        assert!(!layout.contains(-8, 8));
    }

    #[test]
    fn test_overlap_rejected() {
        let result = StateLayout::new(
            "bad",
            16,
            vec![
                StateField::new("a", 0, 8, FieldKind::Register),
                StateField::new("b", 4, 8, FieldKind::Register),
            ],
        );
        assert!(matches!(result, Err(IrError::InvalidLayout(_))));
    }

    #[test]
    fn test_width_and_size_rejected() {
        assert!(StateLayout::new(
            "bad",
            16,
            vec![StateField::new("a", 0, 3, FieldKind::Other)]
        )
        .is_err());
        assert!(StateLayout::new(
            "bad",
            8,
            vec![StateField::new("a", 4, 8, FieldKind::Other)]
        )
        .is_err());
    }
}
