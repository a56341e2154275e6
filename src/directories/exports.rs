//! Export directory (`IMAGE_DIRECTORY_ENTRY_EXPORT`).

use std::collections::BTreeMap;

use crate::{
    directories::{cursor, pad_to, put_u32, EncodeContext, Encoded, ParseContext},
    file::parser::Parser,
    image::DataRef,
    Result,
};

/// Size of `IMAGE_EXPORT_DIRECTORY`.
pub const EXPORT_DIRECTORY_SIZE: u32 = 40;

/// Upper bound on table sizes accepted from a file.
const MAX_EXPORTS: u32 = 0x10_0000;

/// What an exported function slot points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// Code or data inside the image
    Symbol(DataRef),
    /// Forwarded to another DLL, e.g. `NTDLL.RtlAllocateHeap`
    Forwarder(String),
}

/// The export directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDirectory {
    /// Name of this DLL
    pub dll_name: String,
    /// Ordinal of the first function slot
    pub ordinal_base: u32,
    /// Link time
    pub time_date_stamp: u32,
    /// Major version
    pub major_version: u16,
    /// Minor version
    pub minor_version: u16,
    /// Reserved, preserved verbatim
    pub characteristics: u32,
    /// Function slots; unused ordinals are `None`
    pub functions: Vec<Option<ExportTarget>>,
    /// Exported name to function index, byte-wise sorted
    pub names: BTreeMap<String, u32>,
}

impl ExportDirectory {
    /// An empty export directory for `dll_name` with ordinal base 1.
    #[must_use]
    pub fn new(dll_name: &str) -> Self {
        ExportDirectory {
            dll_name: dll_name.to_string(),
            ordinal_base: 1,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            characteristics: 0,
            functions: Vec::new(),
            names: BTreeMap::new(),
        }
    }

    /// Parse the directory at `rva`. Function RVAs inside `[rva, rva + size)` are forwarders.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unmapped tables or implausible counts.
    pub fn parse(ctx: &ParseContext, rva: u32, size: u32) -> Result<Self> {
        let header = ctx.read(rva, EXPORT_DIRECTORY_SIZE)?;
        let mut parser = Parser::new(&header);
        let characteristics = parser.read_le::<u32>()?;
        let time_date_stamp = parser.read_le::<u32>()?;
        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        let name_rva = parser.read_le::<u32>()?;
        let ordinal_base = parser.read_le::<u32>()?;
        let function_count = parser.read_le::<u32>()?;
        let name_count = parser.read_le::<u32>()?;
        let functions_rva = parser.read_le::<u32>()?;
        let names_rva = parser.read_le::<u32>()?;
        let ordinals_rva = parser.read_le::<u32>()?;

        if function_count > MAX_EXPORTS || name_count > MAX_EXPORTS {
            return Err(malformed_error!(
                "Implausible export counts - {} functions, {} names",
                function_count,
                name_count
            ));
        }

        let dll_name = if name_rva == 0 {
            String::new()
        } else {
            ctx.read_cstring(name_rva)?
        };

        let directory_end = u64::from(rva) + u64::from(size);
        let mut functions = Vec::with_capacity(function_count as usize);
        if function_count > 0 {
            let table = ctx.read(functions_rva, function_count * 4)?;
            let mut parser = Parser::new(&table);
            for _ in 0..function_count {
                let target = parser.read_le::<u32>()?;
                functions.push(if target == 0 {
                    None
                } else if target >= rva && u64::from(target) < directory_end {
                    Some(ExportTarget::Forwarder(ctx.read_cstring(target)?))
                } else {
                    Some(ExportTarget::Symbol(ctx.data_ref(target, 1)?.with_size(0)))
                });
            }
        }

        let mut names = BTreeMap::new();
        if name_count > 0 {
            let name_table = ctx.read(names_rva, name_count * 4)?;
            let ordinal_table = ctx.read(ordinals_rva, name_count * 2)?;
            let mut name_parser = Parser::new(&name_table);
            let mut ordinal_parser = Parser::new(&ordinal_table);
            for _ in 0..name_count {
                let name = ctx.read_cstring(name_parser.read_le::<u32>()?)?;
                let index = u32::from(ordinal_parser.read_le::<u16>()?);
                names.insert(name, index);
            }
        }

        Ok(ExportDirectory {
            dll_name,
            ordinal_base,
            time_date_stamp,
            major_version,
            minor_version,
            characteristics,
            functions,
            names,
        })
    }

    /// Encode at `ctx.base_rva()`. Forwarder strings are placed inside the directory so the
    /// loader recognises them.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a symbol reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let base = ctx.base_rva();
        let function_count = u32::try_from(self.functions.len()).unwrap_or(u32::MAX);
        let name_count = u32::try_from(self.names.len()).unwrap_or(u32::MAX);

        let functions_offset = EXPORT_DIRECTORY_SIZE;
        let names_offset = functions_offset + function_count * 4;
        let ordinals_offset = names_offset + name_count * 4;
        let strings_offset = ordinals_offset + name_count * 2;

        let mut bytes = vec![0u8; strings_offset as usize];

        let dll_name_rva = base + cursor(&bytes);
        bytes.extend_from_slice(self.dll_name.as_bytes());
        bytes.push(0);

        for (index, function) in self.functions.iter().enumerate() {
            let value = match function {
                None => 0,
                Some(ExportTarget::Symbol(data)) => ctx.rva_of(data)?,
                Some(ExportTarget::Forwarder(target)) => {
                    let rva = base + cursor(&bytes);
                    bytes.extend_from_slice(target.as_bytes());
                    bytes.push(0);
                    rva
                }
            };
            let at = functions_offset + u32::try_from(index).unwrap_or(u32::MAX) * 4;
            put_u32(&mut bytes, at, value);
        }

        for (position, (name, index)) in self.names.iter().enumerate() {
            let position = u32::try_from(position).unwrap_or(u32::MAX);
            let name_rva = base + cursor(&bytes);
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);

            put_u32(&mut bytes, names_offset + position * 4, name_rva);
            let at = (ordinals_offset + position * 2) as usize;
            #[allow(clippy::cast_possible_truncation)]
            bytes[at..at + 2].copy_from_slice(&(*index as u16).to_le_bytes());
        }

        put_u32(&mut bytes, 0, self.characteristics);
        put_u32(&mut bytes, 4, self.time_date_stamp);
        bytes[8..10].copy_from_slice(&self.major_version.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.minor_version.to_le_bytes());
        put_u32(&mut bytes, 12, dll_name_rva);
        put_u32(&mut bytes, 16, self.ordinal_base);
        put_u32(&mut bytes, 20, function_count);
        put_u32(&mut bytes, 24, name_count);
        put_u32(&mut bytes, 28, base + functions_offset);
        put_u32(&mut bytes, 32, if name_count > 0 { base + names_offset } else { 0 });
        put_u32(&mut bytes, 36, if name_count > 0 { base + ordinals_offset } else { 0 });

        pad_to(&mut bytes, 4);
        Ok(Encoded::new(bytes))
    }

    /// Ordinal of `name`.
    #[must_use]
    pub fn ordinal_of(&self, name: &str) -> Option<u32> {
        self.names.get(name).map(|index| index + self.ordinal_base)
    }

    /// Target exported under `ordinal`.
    #[must_use]
    pub fn by_ordinal(&self, ordinal: u32) -> Option<&ExportTarget> {
        let index = ordinal.checked_sub(self.ordinal_base)?;
        self.functions.get(index as usize)?.as_ref()
    }

    /// Target exported under `name`.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&ExportTarget> {
        self.functions.get(*self.names.get(name)? as usize)?.as_ref()
    }

    /// Append a function slot and return its index.
    pub fn add_function(&mut self, target: Option<ExportTarget>) -> u32 {
        self.functions.push(target);
        u32::try_from(self.functions.len() - 1).unwrap_or(u32::MAX)
    }

    /// Export `name` for function `index`. Returns `false` and keeps the existing entry if
    /// the name is already taken.
    pub fn add_name(&mut self, name: &str, index: u32) -> bool {
        if self.names.contains_key(name) {
            return false;
        }
        self.names.insert(name.to_string(), index);
        true
    }

    /// Iterate `(ordinal, name, target)` over populated slots; `name` is the first name
    /// pointing at the slot, if any.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Option<&str>, &ExportTarget)> + '_ {
        let mut by_index: BTreeMap<u32, &str> = BTreeMap::new();
        for (name, index) in &self.names {
            by_index.entry(*index).or_insert(name.as_str());
        }
        self.functions
            .iter()
            .enumerate()
            .filter_map(move |(index, function)| {
                let index = u32::try_from(index).ok()?;
                Some((
                    index + self.ordinal_base,
                    by_index.get(&index).copied(),
                    function.as_ref()?,
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Section, SectionFlags, SectionStore};

    #[test]
    fn lookup() {
        let mut exports = ExportDirectory::new("guest.dll");
        exports.ordinal_base = 5;
        let first = exports.add_function(Some(ExportTarget::Forwarder("NTDLL.foo".into())));
        exports.add_function(None);
        let third = exports.add_function(Some(ExportTarget::Forwarder("NTDLL.bar".into())));
        assert!(exports.add_name("Foo", first));
        assert!(exports.add_name("Bar", third));
        assert!(!exports.add_name("Foo", third));

        assert_eq!(exports.ordinal_of("Bar"), Some(7));
        assert_eq!(
            exports.by_ordinal(5),
            Some(&ExportTarget::Forwarder("NTDLL.foo".into()))
        );
        assert_eq!(exports.by_ordinal(6), None);
        assert_eq!(exports.by_ordinal(4), None);
        assert_eq!(exports.by_name("Foo"), exports.by_ordinal(5));

        let listed: Vec<_> = exports.iter().map(|(ordinal, name, _)| (ordinal, name)).collect();
        assert_eq!(listed, vec![(5, Some("Foo")), (7, Some("Bar"))]);
    }

    #[test]
    fn encode_then_parse() {
        let mut store = SectionStore::new(0x1000, 0x400);
        let text = store
            .place_section(Section::with_address(
                ".text",
                SectionFlags::CODE,
                0x1000,
                0x100,
                vec![0xC3; 0x100],
            ))
            .unwrap();
        let rdata = store
            .place_section(Section::with_address(
                ".rdata",
                SectionFlags::RDATA,
                0x2000,
                0x400,
                vec![0; 0x400],
            ))
            .unwrap();

        let mut exports = ExportDirectory::new("guest.dll");
        let main = exports.add_function(Some(ExportTarget::Symbol(DataRef::new(text, 0x10))));
        exports.add_function(None);
        let fwd = exports.add_function(Some(ExportTarget::Forwarder("KERNEL32.Sleep".into())));
        exports.add_name("GuestMain", main);
        exports.add_name("Nap", fwd);

        let ctx = EncodeContext::new(&store, 0x1000_0000, false, 0x2000);
        let encoded = exports.encode(&ctx).unwrap();
        store.get_mut(rdata).unwrap().write(0, &encoded.bytes).unwrap();

        let parse = ParseContext::new(&store, &[], 0x1000_0000, false, 0x14c);
        let parsed = ExportDirectory::parse(&parse, 0x2000, encoded.size()).unwrap();

        assert_eq!(parsed.dll_name, "guest.dll");
        assert_eq!(parsed.names, exports.names);
        assert_eq!(parsed.functions.len(), 3);
        assert_eq!(parsed.functions[1], None);
        assert_eq!(
            parsed.functions[2],
            Some(ExportTarget::Forwarder("KERNEL32.Sleep".into()))
        );
        match parsed.by_name("GuestMain") {
            Some(ExportTarget::Symbol(data)) => assert_eq!(data.rva(&store), 0x1010),
            other => panic!("unexpected target {other:?}"),
        }
    }
}
