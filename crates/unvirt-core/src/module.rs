use crate::analysis::alias::AliasClass;
use crate::block::BlockId;
use crate::function::Function;
use crate::layout::StateLayout;
use crate::{IrError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub base: u64,
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub writable: bool,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.base && address.saturating_add(len) <= self.end()
    }
}

/// The mapped segments of the protected binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryImage {
    pub segments: Vec<Segment>,
}

impl BinaryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment(mut self, base: u64, bytes: Vec<u8>, writable: bool) -> Self {
        self.segments.push(Segment {
            base,
            bytes,
            writable,
        });
        self
    }

    pub fn segment_for(&self, address: u64, len: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address, len))
    }

    pub fn read_byte(&self, address: u64) -> Option<u8> {
        self.segment_for(address, 1)
            .map(|s| s.bytes[(address - s.base) as usize])
    }

    /// Little-endian read that only succeeds inside a read-only segment.
    pub fn read_constant(&self, address: u64, bytes: u8) -> Option<u64> {
        let segment = self.segment_for(address, u64::from(bytes))?;
        if segment.writable {
            return None;
        }
        let start = (address - segment.base) as usize;
        let value = segment.bytes[start..start + bytes as usize]
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        Some(value)
    }
}

/// Identifies one memory access instruction in a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessSite {
    pub function: String,
    pub block: BlockId,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub layout: Arc<StateLayout>,
    pub functions: IndexMap<String, Function>,
    #[serde(default)]
    pub image: Option<BinaryImage>,
}

impl Module {
    pub fn new(name: impl Into<String>, layout: Arc<StateLayout>) -> Self {
        Self {
            name: name.into(),
            layout,
            functions: IndexMap::new(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: BinaryImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.name.clone(), function);
    }

    pub fn function(&self, name: &str) -> Result<&Function> {
        self.functions
            .get(name)
            .ok_or_else(|| IrError::FunctionNotFound(name.to_string()))
    }

    pub fn function_mut(&mut self, name: &str) -> Result<&mut Function> {
        self.functions
            .get_mut(name)
            .ok_or_else(|| IrError::FunctionNotFound(name.to_string()))
    }

    pub fn block_count(&self) -> usize {
        self.functions.values().map(|f| f.blocks.len()).sum()
    }

    pub fn instruction_count(&self) -> usize {
        self.functions.values().map(Function::instruction_count).sum()
    }

    /// Alias class of every memory access, read from the tags cached on the instructions.
    pub fn alias_table(&self) -> BTreeMap<AccessSite, AliasClass> {
        let mut table = BTreeMap::new();
        for (name, function) in &self.functions {
            for (block_id, block) in &function.blocks {
                for (index, inst) in block.instructions.iter().enumerate() {
                    if let Some(class) = inst.alias_class() {
                        table.insert(
                            AccessSite {
                                function: name.clone(),
                                block: *block_id,
                                index,
                            },
                            class,
                        );
                    }
                }
            }
        }
        table
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut module: Module = serde_json::from_str(json)?;
        module.layout.validate()?;
        for function in module.functions.values_mut() {
            function.reindex();
        }
        Ok(module)
    }
}
