//! Base relocation table (`IMAGE_DIRECTORY_ENTRY_BASERELOC`).
//!
//! The table is kept as a map of 4 KiB pages to the relocated offsets inside them. Padding
//! entries (`IMAGE_REL_BASED_ABSOLUTE`) are dropped when parsing and re-inserted when
//! encoding to keep every block 4-byte aligned. Whenever relocations are added or removed
//! the whole table is re-encoded into a fresh section at serialization time.

use std::collections::BTreeMap;

use crate::{
    directories::{EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    Result,
};

/// Size of a relocation block header (`VirtualAddress`, `SizeOfBlock`).
const BLOCK_HEADER_SIZE: u32 = 8;

/// Type of one base relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationType {
    /// Padding, ignored by the loader
    Absolute,
    /// Add the high 16 bits of the delta to the 16-bit field
    High,
    /// Add the low 16 bits of the delta to the 16-bit field
    Low,
    /// Add the 32-bit delta to the 32-bit field
    HighLow,
    /// High 16 bits with a 16-bit adjustment word stored in the following entry
    HighAdj(u16),
    /// Add the delta to the 64-bit field
    Dir64,
    /// Machine specific type, preserved verbatim
    Other(u8),
}

impl RelocationType {
    /// Decode the 4-bit type; `HighAdj` carries a zero parameter until it is read.
    #[must_use]
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => RelocationType::Absolute,
            1 => RelocationType::High,
            2 => RelocationType::Low,
            3 => RelocationType::HighLow,
            4 => RelocationType::HighAdj(0),
            10 => RelocationType::Dir64,
            other => RelocationType::Other(other),
        }
    }

    /// The 4-bit type value.
    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            RelocationType::Absolute => 0,
            RelocationType::High => 1,
            RelocationType::Low => 2,
            RelocationType::HighLow => 3,
            RelocationType::HighAdj(_) => 4,
            RelocationType::Dir64 => 10,
            RelocationType::Other(other) => other & 0xF,
        }
    }

    /// The relocation type used for absolute pointers in an image of the given format.
    #[must_use]
    pub fn pointer(pe32_plus: bool) -> Self {
        if pe32_plus {
            RelocationType::Dir64
        } else {
            RelocationType::HighLow
        }
    }
}

/// All base relocations of an image, keyed by page (`RVA / 4096`) and page offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationTable {
    blocks: BTreeMap<u32, BTreeMap<u16, RelocationType>>,
}

impl RelocationTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the relocation blocks at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for blocks with an invalid size.
    pub fn parse(ctx: &ParseContext, rva: u32, size: u32) -> Result<Self> {
        let data = ctx.read(rva, size)?;
        let mut parser = Parser::new(&data);
        let mut table = RelocationTable::new();

        while parser.remaining() >= BLOCK_HEADER_SIZE as usize {
            let page_rva = parser.read_le::<u32>()?;
            let block_size = parser.read_le::<u32>()?;
            if block_size < BLOCK_HEADER_SIZE || block_size as usize > parser.remaining() + 8 {
                return Err(malformed_error!(
                    "Invalid relocation block size {:#x} for page {:#x}",
                    block_size,
                    page_rva
                ));
            }

            let mut count = (block_size - BLOCK_HEADER_SIZE) / 2;
            while count > 0 {
                let entry = parser.read_le::<u16>()?;
                count -= 1;

                #[allow(clippy::cast_possible_truncation)]
                let kind = RelocationType::from_raw((entry >> 12) as u8);
                let rva = page_rva.wrapping_add(u32::from(entry & 0xFFF));
                match kind {
                    RelocationType::Absolute => {}
                    RelocationType::HighAdj(_) => {
                        if count == 0 {
                            return Err(malformed_error!(
                                "HIGHADJ relocation at {:#x} without parameter",
                                rva
                            ));
                        }
                        let parameter = parser.read_le::<u16>()?;
                        count -= 1;
                        table.add(rva, RelocationType::HighAdj(parameter));
                    }
                    other => table.add(rva, other),
                }
            }
        }
        Ok(table)
    }

    /// Add or replace the relocation at `rva`.
    pub fn add(&mut self, rva: u32, kind: RelocationType) {
        if kind == RelocationType::Absolute {
            return;
        }
        #[allow(clippy::cast_possible_truncation)]
        let offset = (rva & 0xFFF) as u16;
        self.blocks.entry(rva >> 12).or_default().insert(offset, kind);
    }

    /// Remove the relocation at `rva`, returning its type.
    pub fn remove(&mut self, rva: u32) -> Option<RelocationType> {
        let page = rva >> 12;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (rva & 0xFFF) as u16;
        let block = self.blocks.get_mut(&page)?;
        let removed = block.remove(&offset);
        if block.is_empty() {
            self.blocks.remove(&page);
        }
        removed
    }

    /// The relocation at `rva`.
    #[must_use]
    pub fn get(&self, rva: u32) -> Option<RelocationType> {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (rva & 0xFFF) as u16;
        self.blocks.get(&(rva >> 12))?.get(&offset).copied()
    }

    /// Iterate `(rva, type)` in ascending RVA order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, RelocationType)> + '_ {
        self.blocks.iter().flat_map(|(page, block)| {
            block
                .iter()
                .map(move |(offset, kind)| ((page << 12) | u32::from(*offset), *kind))
        })
    }

    /// Number of relocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if the table holds no relocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Encode all blocks. The table contains no pointers, so the base is irrelevant.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] only on internal size mismatches.
    pub fn encode(&self, _ctx: &EncodeContext) -> Result<Encoded> {
        let mut bytes = Vec::new();
        for (page, block) in &self.blocks {
            let mut entries: Vec<u16> = Vec::with_capacity(block.len() + 1);
            for (offset, kind) in block {
                entries.push((u16::from(kind.raw()) << 12) | offset);
                if let RelocationType::HighAdj(parameter) = kind {
                    entries.push(*parameter);
                }
            }
            if entries.len() % 2 == 1 {
                entries.push(0);
            }

            let size = BLOCK_HEADER_SIZE + 2 * u32::try_from(entries.len()).unwrap_or(0);
            bytes.extend_from_slice(&(page << 12).to_le_bytes());
            bytes.extend_from_slice(&size.to_le_bytes());
            for entry in entries {
                bytes.extend_from_slice(&entry.to_le_bytes());
            }
        }
        Ok(Encoded::new(bytes))
    }
}
