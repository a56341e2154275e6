//! Delay-load import directory (`IMAGE_DIRECTORY_ENTRY_DELAY_IMPORT`).
//!
//! Unlike regular imports, the delay-load IAT initially points at linker-generated helper
//! thunks, so it is never rewritten when the directory is re-encoded; only the descriptor
//! table, the name table and the strings are emitted. Descriptors from old linkers that
//! store virtual addresses instead of RVAs (attribute bit 0 clear) are normalized to the
//! RVA form.

use std::collections::BTreeSet;

use crate::{
    directories::{
        imports::{classify, read_thunks, unresolved_runs, ImportEntry, SplitOutcome, ThunkWriter},
        put_u32, EncodeContext, Encoded, ParseContext,
    },
    file::parser::Parser,
    image::DataRef,
    Result,
};

/// Size of one `IMAGE_DELAYLOAD_DESCRIPTOR`.
pub const DELAY_DESCRIPTOR_SIZE: u32 = 32;

/// `dlattrRva`: descriptor fields are RVAs.
pub const ATTRIBUTE_RVA_BASED: u32 = 1;

/// One delay-load descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayImportDescriptor {
    /// Attributes; bit 0 set means RVA based
    pub attributes: u32,
    /// Name of the delay-loaded DLL
    pub dll_name: String,
    /// Slot receiving the module handle
    pub module_handle: DataRef,
    /// First IAT slot
    pub iat: DataRef,
    /// Bound IAT copy, optional
    pub bound_iat: DataRef,
    /// Unload IAT copy, optional
    pub unload_iat: DataRef,
    /// Bind time stamp
    pub time_date_stamp: u32,
    /// Imported functions in IAT slot order
    pub entries: Vec<ImportEntry>,
}

impl DelayImportDescriptor {
    /// Reference to the IAT slot of entry `index`.
    #[must_use]
    pub fn slot(&self, index: usize, ptr_size: u32) -> DataRef {
        let delta = u32::try_from(index).unwrap_or(u32::MAX).wrapping_mul(ptr_size);
        self.iat.offset_by(delta).with_size(ptr_size)
    }

    /// Split around the `resolved` entry indices. IAT, bound IAT and unload IAT move by
    /// `run_start * ptr_size` alike.
    #[must_use]
    pub fn split(
        &self,
        resolved: &BTreeSet<usize>,
        ptr_size: u32,
    ) -> (Vec<DelayImportDescriptor>, SplitOutcome) {
        let runs = unresolved_runs(self.entries.len(), resolved);
        let outcome = classify(self.entries.len(), &runs);
        if outcome == SplitOutcome::Unchanged {
            return (vec![self.clone()], outcome);
        }

        let pieces = runs
            .iter()
            .map(|(start, end)| {
                let delta = u32::try_from(*start).unwrap_or(u32::MAX) * ptr_size;
                DelayImportDescriptor {
                    attributes: self.attributes,
                    dll_name: self.dll_name.clone(),
                    module_handle: self.module_handle,
                    iat: self.iat.offset_by(delta),
                    bound_iat: self.bound_iat.offset_by(delta),
                    unload_iat: self.unload_iat.offset_by(delta),
                    time_date_stamp: self.time_date_stamp,
                    entries: self.entries[*start..*end].to_vec(),
                }
            })
            .collect();
        (pieces, outcome)
    }
}

/// The delay-load import directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayImportDirectory {
    /// Descriptors in table order
    pub descriptors: Vec<DelayImportDescriptor>,
}

impl DelayImportDirectory {
    /// Parse the descriptor table at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a descriptor references unmapped data.
    pub fn parse(ctx: &ParseContext, rva: u32, _size: u32) -> Result<Self> {
        let mut descriptors = Vec::new();
        let mut descriptor_rva = rva;

        loop {
            let raw = ctx.read(descriptor_rva, DELAY_DESCRIPTOR_SIZE)?;
            let mut parser = Parser::new(&raw);
            let attributes = parser.read_le::<u32>()?;
            let mut fields = [0u32; 6];
            for field in &mut fields {
                *field = parser.read_le::<u32>()?;
            }
            let time_date_stamp = parser.read_le::<u32>()?;
            let [name, module_handle, iat, names, bound_iat, unload_iat] = fields;
            if name == 0 {
                break;
            }

            // Old descriptors store virtual addresses.
            let to_rva = |value: u32| -> Result<u32> {
                if value == 0 || attributes & ATTRIBUTE_RVA_BASED != 0 {
                    Ok(value)
                } else {
                    ctx.va_to_rva(u64::from(value))
                }
            };

            let ptr = ctx.ptr_size();
            let entries = read_thunks(ctx, to_rva(names)?)?;
            let table_size = u32::try_from(entries.len().max(1)).unwrap_or(u32::MAX) * ptr;

            descriptors.push(DelayImportDescriptor {
                attributes,
                dll_name: ctx.read_cstring(to_rva(name)?)?,
                module_handle: ctx.data_ref_or_null(to_rva(module_handle)?, ptr)?,
                iat: ctx.data_ref(to_rva(iat)?, table_size)?,
                bound_iat: ctx.data_ref_or_null(to_rva(bound_iat)?, table_size)?,
                unload_iat: ctx.data_ref_or_null(to_rva(unload_iat)?, table_size)?,
                time_date_stamp,
                entries,
            });
            descriptor_rva += DELAY_DESCRIPTOR_SIZE;
        }

        Ok(DelayImportDirectory { descriptors })
    }

    /// Encode descriptors, name tables and strings at `ctx.base_rva()`, always RVA based.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let ptr = ctx.ptr_size();
        let count = u32::try_from(self.descriptors.len()).unwrap_or(u32::MAX);
        let table_size = (count + 1) * DELAY_DESCRIPTOR_SIZE;
        let names_size: u32 = self
            .descriptors
            .iter()
            .map(|d| (u32::try_from(d.entries.len()).unwrap_or(u32::MAX) + 1) * ptr)
            .sum();

        let mut bytes = vec![0u8; (table_size + names_size) as usize];
        let mut strings = ThunkWriter::new(table_size + names_size);
        let mut names_offset = table_size;

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let names_rva = ctx.base_rva() + names_offset;
            for entry in &descriptor.entries {
                let thunk = strings.thunk(ctx, entry);
                let mut encoded = Vec::with_capacity(ptr as usize);
                ctx.push_ptr(&mut encoded, thunk);
                let at = names_offset as usize;
                bytes[at..at + encoded.len()].copy_from_slice(&encoded);
                names_offset += ptr;
            }
            names_offset += ptr;

            let name_rva = strings.string(ctx, &descriptor.dll_name);
            let at = u32::try_from(index).unwrap_or(u32::MAX) * DELAY_DESCRIPTOR_SIZE;
            put_u32(&mut bytes, at, descriptor.attributes | ATTRIBUTE_RVA_BASED);
            put_u32(&mut bytes, at + 4, name_rva);
            put_u32(&mut bytes, at + 8, ctx.rva_or_zero(&descriptor.module_handle)?);
            put_u32(&mut bytes, at + 12, ctx.rva_of(&descriptor.iat)?);
            put_u32(&mut bytes, at + 16, names_rva);
            put_u32(&mut bytes, at + 20, ctx.rva_or_zero(&descriptor.bound_iat)?);
            put_u32(&mut bytes, at + 24, ctx.rva_or_zero(&descriptor.unload_iat)?);
            put_u32(&mut bytes, at + 28, descriptor.time_date_stamp);
        }

        bytes.extend_from_slice(&strings.strings);
        super::pad_to(&mut bytes, 4);
        Ok(Encoded::new(bytes))
    }

    /// Replace descriptor `index` by the result of splitting it around `resolved`.
    pub fn split_descriptor(
        &mut self,
        index: usize,
        resolved: &BTreeSet<usize>,
        ptr_size: u32,
    ) -> SplitOutcome {
        let Some(descriptor) = self.descriptors.get(index) else {
            return SplitOutcome::Unchanged;
        };
        let (pieces, outcome) = descriptor.split(resolved, ptr_size);
        if outcome != SplitOutcome::Unchanged {
            self.descriptors.splice(index..=index, pieces);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Section, SectionFlags, SectionStore};

    fn store() -> (SectionStore, crate::image::SectionId) {
        let mut store = SectionStore::new(0x1000, 0x400);
        let id = store
            .place_section(Section::with_address(
                ".didat",
                SectionFlags::DATA,
                0x3000,
                0x1000,
                vec![0; 0x1000],
            ))
            .unwrap();
        (store, id)
    }

    fn descriptor(id: crate::image::SectionId) -> DelayImportDescriptor {
        DelayImportDescriptor {
            attributes: ATTRIBUTE_RVA_BASED,
            dll_name: "guest.dll".into(),
            module_handle: DataRef::new(id, 0x0),
            iat: DataRef::new(id, 0x10),
            bound_iat: DataRef::new(id, 0x40),
            unload_iat: DataRef::null(),
            time_date_stamp: 0,
            entries: ["A", "B", "C", "D"]
                .iter()
                .map(|name| ImportEntry::named(name))
                .collect(),
        }
    }

    #[test]
    fn split_moves_all_tables() {
        let (_, id) = store();
        let (pieces, outcome) = descriptor(id).split(&BTreeSet::from([0, 2]), 8);

        assert_eq!(outcome, SplitOutcome::Split(2));
        assert_eq!(pieces[0].iat.offset(), 0x18);
        assert_eq!(pieces[0].bound_iat.offset(), 0x48);
        assert!(pieces[0].unload_iat.is_null());
        assert_eq!(pieces[1].iat.offset(), 0x10 + 3 * 8);
        assert_eq!(pieces[1].entries, vec![ImportEntry::named("D")]);
        assert_eq!(pieces[1].module_handle, pieces[0].module_handle);
    }

    #[test]
    fn encode_then_parse() {
        let (mut store, id) = store();
        let directory = DelayImportDirectory {
            descriptors: vec![descriptor(id)],
        };

        let ctx = EncodeContext::new(&store, 0x40_0000, false, 0x3100);
        let encoded = directory.encode(&ctx).unwrap();
        assert!(encoded.patches.is_empty());
        store.get_mut(id).unwrap().write(0x100, &encoded.bytes).unwrap();

        let parse = ParseContext::new(&store, &[], 0x40_0000, false, 0x14c);
        let parsed = DelayImportDirectory::parse(&parse, 0x3100, encoded.size()).unwrap();
        assert_eq!(parsed.descriptors.len(), 1);
        let parsed = &parsed.descriptors[0];
        assert_eq!(parsed.dll_name, "guest.dll");
        assert_eq!(parsed.entries, directory.descriptors[0].entries);
        assert_eq!(parsed.iat.rva(&store), 0x3010);
        assert_eq!(parsed.bound_iat.rva(&store), 0x3040);
        assert!(parsed.unload_iat.is_null());
    }
}
