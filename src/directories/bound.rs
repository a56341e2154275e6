//! Bound import directory (`IMAGE_DIRECTORY_ENTRY_BOUND_IMPORT`).
//!
//! Bound import records usually live in the header region right after the section table,
//! outside every section. All name offsets are relative to the start of the directory.

use crate::{
    directories::{EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    Result,
};

/// Size of a bound import descriptor or forwarder record.
const RECORD_SIZE: usize = 8;

/// A forwarder of a bound import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundForwarder {
    /// Forwarded-to module
    pub module_name: String,
    /// Time stamp of that module when bound
    pub time_date_stamp: u32,
}

/// One bound module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundImport {
    /// Bound module
    pub module_name: String,
    /// Time stamp of the module when bound
    pub time_date_stamp: u32,
    /// Modules this one forwards into
    pub forwarders: Vec<BoundForwarder>,
}

/// The bound import directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundImportDirectory {
    /// Bound modules in table order
    pub imports: Vec<BoundImport>,
}

fn name_at(view: &[u8], offset: u16) -> Result<String> {
    let start = usize::from(offset);
    let tail = view
        .get(start..)
        .ok_or_else(|| malformed_error!("Bound import name offset {:#x} out of range", offset))?;
    let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

impl BoundImportDirectory {
    /// Parse the records at `rva`, which may lie in the header region.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for out-of-range names or truncated records.
    pub fn parse(ctx: &ParseContext, rva: u32, _size: u32) -> Result<Self> {
        let view = ctx.view(rva)?;
        let mut parser = Parser::new(&view);
        let mut imports = Vec::new();

        loop {
            let time_date_stamp = parser.read_le::<u32>()?;
            let name_offset = parser.read_le::<u16>()?;
            let forwarder_count = parser.read_le::<u16>()?;
            if time_date_stamp == 0 && name_offset == 0 && forwarder_count == 0 {
                break;
            }

            let mut forwarders = Vec::with_capacity(usize::from(forwarder_count));
            for _ in 0..forwarder_count {
                let time_date_stamp = parser.read_le::<u32>()?;
                let name_offset = parser.read_le::<u16>()?;
                let _reserved = parser.read_le::<u16>()?;
                forwarders.push(BoundForwarder {
                    module_name: name_at(&view, name_offset)?,
                    time_date_stamp,
                });
            }

            imports.push(BoundImport {
                module_name: name_at(&view, name_offset)?,
                time_date_stamp,
                forwarders,
            });
        }
        Ok(BoundImportDirectory { imports })
    }

    /// Encode records followed by the module names.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the names do not fit 16-bit offsets.
    pub fn encode(&self, _ctx: &EncodeContext) -> Result<Encoded> {
        let records: usize = self
            .imports
            .iter()
            .map(|import| 1 + import.forwarders.len())
            .sum::<usize>()
            + 1;
        let mut bytes = vec![0u8; records * RECORD_SIZE];
        let mut names = Vec::new();
        let names_start = bytes.len();

        let name_offset = |name: &str, names: &mut Vec<u8>| -> Result<u16> {
            let offset = names_start + names.len();
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            u16::try_from(offset)
                .map_err(|_| malformed_error!("Bound import names exceed 64 KiB"))
        };

        let mut at = 0;
        for import in &self.imports {
            let offset = name_offset(&import.module_name, &mut names)?;
            let count = u16::try_from(import.forwarders.len())
                .map_err(|_| malformed_error!("Too many bound forwarders"))?;
            bytes[at..at + 4].copy_from_slice(&import.time_date_stamp.to_le_bytes());
            bytes[at + 4..at + 6].copy_from_slice(&offset.to_le_bytes());
            bytes[at + 6..at + 8].copy_from_slice(&count.to_le_bytes());
            at += RECORD_SIZE;

            for forwarder in &import.forwarders {
                let offset = name_offset(&forwarder.module_name, &mut names)?;
                bytes[at..at + 4].copy_from_slice(&forwarder.time_date_stamp.to_le_bytes());
                bytes[at + 4..at + 6].copy_from_slice(&offset.to_le_bytes());
                at += RECORD_SIZE;
            }
        }

        bytes.extend_from_slice(&names);
        super::pad_to(&mut bytes, 4);
        Ok(Encoded::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SectionStore;

    #[test]
    fn header_resident_roundtrip() {
        let directory = BoundImportDirectory {
            imports: vec![
                BoundImport {
                    module_name: "KERNEL32.dll".into(),
                    time_date_stamp: 0x1111_1111,
                    forwarders: vec![BoundForwarder {
                        module_name: "NTDLL.DLL".into(),
                        time_date_stamp: 0x2222_2222,
                    }],
                },
                BoundImport {
                    module_name: "USER32.dll".into(),
                    time_date_stamp: 0x3333_3333,
                    forwarders: Vec::new(),
                },
            ],
        };

        let encoded = directory
            .encode(&EncodeContext::sizing(0x40_0000, false))
            .unwrap();
        let mut header = vec![0u8; 0x400];
        header[0x300..0x300 + encoded.bytes.len()].copy_from_slice(&encoded.bytes);

        let store = SectionStore::new(0x1000, 0x400);
        let ctx = ParseContext::new(&store, &header, 0x40_0000, false, 0x14c);
        let parsed = BoundImportDirectory::parse(&ctx, 0x300, encoded.size()).unwrap();
        assert_eq!(parsed, directory);
    }
}
