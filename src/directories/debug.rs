//! Debug directory (`IMAGE_DIRECTORY_ENTRY_DEBUG`).
//!
//! Each entry carries both the RVA and the *file offset* of its data. The RVA form is kept
//! as a [`DataRef`]; the file offset is recomputed by the writer once the raw layout is
//! known. Entries whose data is not mapped at all (typically in the overlay) keep their
//! file offset, which the writer shifts if the overlay moves.

use uguid::Guid;

use crate::{
    directories::{put_u32, EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    image::{DataRef, SectionStore},
    Result,
};

/// Size of one `IMAGE_DEBUG_DIRECTORY`.
pub const DEBUG_ENTRY_SIZE: u32 = 28;
/// Offset of `PointerToRawData` inside an entry.
pub const POINTER_TO_RAW_DATA_OFFSET: u32 = 24;

/// `IMAGE_DEBUG_TYPE_CODEVIEW`
pub const DEBUG_TYPE_CODEVIEW: u32 = 2;
/// `IMAGE_DEBUG_TYPE_POGO`
pub const DEBUG_TYPE_POGO: u32 = 13;
/// `IMAGE_DEBUG_TYPE_REPRO`
pub const DEBUG_TYPE_REPRO: u32 = 16;

const RSDS_SIGNATURE: &[u8; 4] = b"RSDS";

/// Where the data of a debug entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugData {
    /// No data
    None,
    /// Mapped into a section
    Mapped(DataRef),
    /// Only present in the file, outside every section
    Unmapped {
        /// File offset as read
        file_offset: u32,
    },
}

/// One debug directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEntry {
    /// Reserved
    pub characteristics: u32,
    /// Creation time
    pub time_date_stamp: u32,
    /// Format major version
    pub major_version: u16,
    /// Format minor version
    pub minor_version: u16,
    /// `IMAGE_DEBUG_TYPE_*`
    pub kind: u32,
    /// Size of the data
    pub size_of_data: u32,
    /// Location of the data
    pub data: DebugData,
}

/// Decoded CodeView `RSDS` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeView {
    /// PDB signature
    pub guid: Guid,
    /// PDB age
    pub age: u32,
    /// PDB path
    pub path: String,
}

impl DebugEntry {
    /// Decode the CodeView record of a mapped `RSDS` entry.
    #[must_use]
    pub fn codeview(&self, store: &SectionStore) -> Option<CodeView> {
        let DebugData::Mapped(data) = self.data else {
            return None;
        };
        if self.kind != DEBUG_TYPE_CODEVIEW || self.size_of_data < 24 {
            return None;
        }

        let raw = data.read(store, self.size_of_data)?;
        if &raw[..4] != RSDS_SIGNATURE {
            return None;
        }
        let guid: [u8; 16] = raw[4..20].try_into().ok()?;
        let age = u32::from_le_bytes(raw[20..24].try_into().ok()?);
        let path_bytes = &raw[24..];
        let len = path_bytes.iter().position(|b| *b == 0).unwrap_or(path_bytes.len());

        Some(CodeView {
            guid: Guid::from_bytes(guid),
            age,
            path: String::from_utf8_lossy(&path_bytes[..len]).into_owned(),
        })
    }
}

/// The debug directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugDirectory {
    /// Entries in table order
    pub entries: Vec<DebugEntry>,
}

impl DebugDirectory {
    /// Parse `size / 28` entries at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the table or mapped data is out of bounds.
    pub fn parse(ctx: &ParseContext, rva: u32, size: u32) -> Result<Self> {
        let count = size / DEBUG_ENTRY_SIZE;
        let raw = ctx.read(rva, count * DEBUG_ENTRY_SIZE)?;
        let mut parser = Parser::new(&raw);
        let mut entries = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let characteristics = parser.read_le::<u32>()?;
            let time_date_stamp = parser.read_le::<u32>()?;
            let major_version = parser.read_le::<u16>()?;
            let minor_version = parser.read_le::<u16>()?;
            let kind = parser.read_le::<u32>()?;
            let size_of_data = parser.read_le::<u32>()?;
            let address_of_raw_data = parser.read_le::<u32>()?;
            let pointer_to_raw_data = parser.read_le::<u32>()?;

            let data = if address_of_raw_data != 0 {
                DebugData::Mapped(ctx.data_ref(address_of_raw_data, size_of_data)?)
            } else if pointer_to_raw_data != 0 {
                DebugData::Unmapped {
                    file_offset: pointer_to_raw_data,
                }
            } else {
                DebugData::None
            };

            entries.push(DebugEntry {
                characteristics,
                time_date_stamp,
                major_version,
                minor_version,
                kind,
                size_of_data,
                data,
            });
        }
        Ok(DebugDirectory { entries })
    }

    /// Encode the entry table at `ctx.base_rva()`. `PointerToRawData` is written as the
    /// stored file offset (or zero) and fixed up by the writer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a mapped reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let mut bytes = vec![0u8; self.entries.len() * DEBUG_ENTRY_SIZE as usize];
        for (index, entry) in self.entries.iter().enumerate() {
            let at = u32::try_from(index).unwrap_or(u32::MAX) * DEBUG_ENTRY_SIZE;
            let (address, pointer) = match entry.data {
                DebugData::None => (0, 0),
                DebugData::Mapped(data) => (ctx.rva_of(&data)?, 0),
                DebugData::Unmapped { file_offset } => (0, file_offset),
            };
            put_u32(&mut bytes, at, entry.characteristics);
            put_u32(&mut bytes, at + 4, entry.time_date_stamp);
            let at_usize = at as usize;
            bytes[at_usize + 8..at_usize + 10].copy_from_slice(&entry.major_version.to_le_bytes());
            bytes[at_usize + 10..at_usize + 12]
                .copy_from_slice(&entry.minor_version.to_le_bytes());
            put_u32(&mut bytes, at + 12, entry.kind);
            put_u32(&mut bytes, at + 16, entry.size_of_data);
            put_u32(&mut bytes, at + 20, address);
            put_u32(&mut bytes, at + POINTER_TO_RAW_DATA_OFFSET, pointer);
        }
        Ok(Encoded::new(bytes))
    }

    /// First CodeView record, if any.
    #[must_use]
    pub fn codeview(&self, store: &SectionStore) -> Option<CodeView> {
        self.entries.iter().find_map(|entry| entry.codeview(store))
    }
}
