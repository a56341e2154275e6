//! Import directory (`IMAGE_DIRECTORY_ENTRY_IMPORT`).
//!
//! Every [`ImportDescriptor`] names a DLL, lists its imported functions in IAT slot order
//! and references the first slot of its import address table. The IAT itself is not part
//! of the directory: it lives in whatever section the linker put it and code calls through
//! it, so it must never move. When the directory is re-encoded, a fresh lookup table,
//! hint/name table and name strings are emitted next to the descriptors, and the IAT
//! slots are patched in place with the matching unbound thunks.
//!
//! Descriptors can be split once some of their functions have been resolved statically
//! (see [`ImportDescriptor::split`]): the resolved slots are left to the caller, and every
//! maximal run of unresolved entries becomes its own descriptor pointing into the middle
//! of the original IAT.

use std::collections::BTreeSet;

use crate::{
    directories::{cursor, pad_to, put_u32, EncodeContext, Encoded, ParseContext, Patch},
    file::io::read_le_at_dyn,
    image::DataRef,
    Result,
};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`.
pub const DESCRIPTOR_SIZE: u32 = 20;

/// Upper bound of thunks read per table, guarding against unterminated tables.
const MAX_THUNKS: usize = 0x1_0000;

/// One imported function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportEntry {
    /// Import by ordinal
    Ordinal(u16),
    /// Import by name with a hint into the exporter's name table
    Name {
        /// Index hint
        hint: u16,
        /// Function name
        name: String,
    },
}

impl ImportEntry {
    /// Import `name` with hint `0`.
    #[must_use]
    pub fn named(name: &str) -> Self {
        ImportEntry::Name {
            hint: 0,
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ImportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportEntry::Ordinal(ordinal) => write!(f, "#{ordinal}"),
            ImportEntry::Name { name, .. } => write!(f, "{name}"),
        }
    }
}

/// Result of splitting a descriptor around resolved entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Nothing was resolved
    Unchanged,
    /// Every entry was resolved; the descriptor is gone
    Removed,
    /// A resolved prefix was cut; the descriptor now starts later in the IAT
    HeadShifted,
    /// A resolved suffix was cut
    TailTrimmed,
    /// Resolved entries in the middle produced this many descriptors
    Split(usize),
}

/// One `IMAGE_IMPORT_DESCRIPTOR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// Name of the imported DLL
    pub dll_name: String,
    /// Imported functions, in IAT slot order
    pub entries: Vec<ImportEntry>,
    /// First IAT slot
    pub first_thunk: DataRef,
    /// `0` unless the IAT is bound
    pub time_date_stamp: u32,
    /// Index of the first forwarder reference
    pub forwarder_chain: u32,
}

impl ImportDescriptor {
    /// A descriptor for `dll_name` whose IAT starts at `first_thunk`.
    #[must_use]
    pub fn new(dll_name: &str, entries: Vec<ImportEntry>, first_thunk: DataRef) -> Self {
        ImportDescriptor {
            dll_name: dll_name.to_string(),
            entries,
            first_thunk,
            time_date_stamp: 0,
            forwarder_chain: 0,
        }
    }

    /// Reference to the IAT slot of entry `index`.
    #[must_use]
    pub fn slot(&self, index: usize, ptr_size: u32) -> DataRef {
        let delta = u32::try_from(index).unwrap_or(u32::MAX).wrapping_mul(ptr_size);
        self.first_thunk.offset_by(delta).with_size(ptr_size)
    }

    /// Split this descriptor around the `resolved` entry indices.
    ///
    /// Unresolved entries are grouped into maximal contiguous runs; each run becomes a
    /// descriptor whose IAT reference is moved by `run_start * ptr_size`.
    #[must_use]
    pub fn split(
        &self,
        resolved: &BTreeSet<usize>,
        ptr_size: u32,
    ) -> (Vec<ImportDescriptor>, SplitOutcome) {
        let runs = unresolved_runs(self.entries.len(), resolved);
        let outcome = classify(self.entries.len(), &runs);
        if outcome == SplitOutcome::Unchanged {
            return (vec![self.clone()], outcome);
        }

        let pieces = runs
            .iter()
            .map(|(start, end)| ImportDescriptor {
                dll_name: self.dll_name.clone(),
                entries: self.entries[*start..*end].to_vec(),
                first_thunk: self.slot(*start, ptr_size).with_size(
                    u32::try_from(end - start).unwrap_or(u32::MAX) * ptr_size,
                ),
                time_date_stamp: 0,
                forwarder_chain: 0,
            })
            .collect();
        (pieces, outcome)
    }
}

/// Maximal `[start, end)` runs of indices below `len` that are not in `resolved`.
pub(crate) fn unresolved_runs(len: usize, resolved: &BTreeSet<usize>) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for index in 0..len {
        match (resolved.contains(&index), start) {
            (false, None) => start = Some(index),
            (true, Some(run_start)) => {
                runs.push((run_start, index));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(run_start) = start {
        runs.push((run_start, len));
    }
    runs
}

/// Classify the runs produced by [`unresolved_runs`].
///
/// A single run with both a resolved prefix and a resolved suffix reports as
/// [`SplitOutcome::HeadShifted`]; the suffix is dropped implicitly by the shorter lookup
/// table.
pub(crate) fn classify(len: usize, runs: &[(usize, usize)]) -> SplitOutcome {
    match runs {
        [] => SplitOutcome::Removed,
        [(0, end)] if *end == len => SplitOutcome::Unchanged,
        [(0, _)] => SplitOutcome::TailTrimmed,
        [_] => SplitOutcome::HeadShifted,
        _ => SplitOutcome::Split(runs.len()),
    }
}

/// Read a zero-terminated thunk table at `rva`.
pub(crate) fn read_thunks(ctx: &ParseContext, rva: u32) -> Result<Vec<ImportEntry>> {
    let view = ctx.view(rva)?;
    let ordinal_flag = ordinal_flag(ctx.pe32_plus());
    let mut offset = 0;
    let mut entries = Vec::new();

    loop {
        let thunk = read_le_at_dyn(&view, &mut offset, ctx.pe32_plus())?;
        if thunk == 0 {
            break;
        }
        if entries.len() >= MAX_THUNKS {
            return Err(malformed_error!("Unterminated thunk table at {:#x}", rva));
        }

        if thunk & ordinal_flag != 0 {
            #[allow(clippy::cast_possible_truncation)]
            entries.push(ImportEntry::Ordinal(thunk as u16));
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let hint_rva = (thunk & 0x7FFF_FFFF) as u32;
            let hint_bytes = ctx.read(hint_rva, 2)?;
            entries.push(ImportEntry::Name {
                hint: u16::from_le_bytes([hint_bytes[0], hint_bytes[1]]),
                name: ctx.read_cstring(hint_rva + 2)?,
            });
        }
    }
    Ok(entries)
}

/// The import-by-ordinal bit of a thunk.
#[must_use]
pub fn ordinal_flag(pe32_plus: bool) -> u64 {
    if pe32_plus {
        1 << 63
    } else {
        1 << 31
    }
}

/// Emits hint/name entries and thunk values into a string area.
pub(crate) struct ThunkWriter {
    pub(crate) strings: Vec<u8>,
    strings_base: u32,
}

impl ThunkWriter {
    pub(crate) fn new(strings_base: u32) -> Self {
        ThunkWriter {
            strings: Vec::new(),
            strings_base,
        }
    }

    /// Thunk value for `entry`, emitting its hint/name entry.
    pub(crate) fn thunk(&mut self, ctx: &EncodeContext, entry: &ImportEntry) -> u64 {
        match entry {
            ImportEntry::Ordinal(ordinal) => ordinal_flag(ctx.pe32_plus()) | u64::from(*ordinal),
            ImportEntry::Name { hint, name } => {
                pad_to(&mut self.strings, 2);
                let rva = ctx.base_rva() + self.strings_base + cursor(&self.strings);
                self.strings.extend_from_slice(&hint.to_le_bytes());
                self.strings.extend_from_slice(name.as_bytes());
                self.strings.push(0);
                u64::from(rva)
            }
        }
    }

    /// RVA of `name`, emitted as a NUL-terminated string.
    pub(crate) fn string(&mut self, ctx: &EncodeContext, name: &str) -> u32 {
        let rva = ctx.base_rva() + self.strings_base + cursor(&self.strings);
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        rva
    }
}

/// The import directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportDirectory {
    /// Descriptors in table order
    pub descriptors: Vec<ImportDescriptor>,
}

impl ImportDirectory {
    /// Parse the descriptor table at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a descriptor references unmapped data.
    pub fn parse(ctx: &ParseContext, rva: u32, _size: u32) -> Result<Self> {
        let ptr = ctx.ptr_size();
        let mut descriptors = Vec::new();
        let mut descriptor_rva = rva;

        loop {
            let raw = ctx.read(descriptor_rva, DESCRIPTOR_SIZE)?;
            let field = |index: usize| {
                u32::from_le_bytes([
                    raw[index * 4],
                    raw[index * 4 + 1],
                    raw[index * 4 + 2],
                    raw[index * 4 + 3],
                ])
            };
            let (lookup, time_date_stamp, forwarder_chain, name, first_thunk) =
                (field(0), field(1), field(2), field(3), field(4));
            if name == 0 || first_thunk == 0 {
                break;
            }

            let entries = read_thunks(ctx, if lookup != 0 { lookup } else { first_thunk })?;
            let iat_size = u32::try_from(entries.len().max(1)).unwrap_or(u32::MAX) * ptr;
            descriptors.push(ImportDescriptor {
                dll_name: ctx.read_cstring(name)?,
                entries,
                first_thunk: ctx.data_ref(first_thunk, iat_size)?,
                time_date_stamp,
                forwarder_chain,
            });
            descriptor_rva += DESCRIPTOR_SIZE;
        }

        Ok(ImportDirectory { descriptors })
    }

    /// Encode descriptors, lookup tables and strings at `ctx.base_rva()`; IAT slots are
    /// returned as patches. Re-encoded imports are always unbound.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if an IAT reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Encoded> {
        let ptr = ctx.ptr_size();
        let count = u32::try_from(self.descriptors.len()).unwrap_or(u32::MAX);
        let table_size = (count + 1) * DESCRIPTOR_SIZE;
        let lookup_size: u32 = self
            .descriptors
            .iter()
            .map(|descriptor| {
                (u32::try_from(descriptor.entries.len()).unwrap_or(u32::MAX) + 1) * ptr
            })
            .sum();

        let mut bytes = vec![0u8; (table_size + lookup_size) as usize];
        let mut strings = ThunkWriter::new(table_size + lookup_size);
        let mut patches = Vec::with_capacity(self.descriptors.len());
        let mut lookup_offset = table_size;

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let lookup_rva = ctx.base_rva() + lookup_offset;
            let mut iat = Vec::with_capacity(descriptor.entries.len() * ptr as usize);

            for entry in &descriptor.entries {
                let thunk = strings.thunk(ctx, entry);
                let mut encoded = Vec::with_capacity(ptr as usize);
                ctx.push_ptr(&mut encoded, thunk);
                let at = lookup_offset as usize;
                bytes[at..at + encoded.len()].copy_from_slice(&encoded);
                iat.extend_from_slice(&encoded);
                lookup_offset += ptr;
            }
            lookup_offset += ptr;

            let name_rva = strings.string(ctx, &descriptor.dll_name);
            let first_thunk = ctx.rva_of(&descriptor.first_thunk)?;

            let at = u32::try_from(index).unwrap_or(u32::MAX) * DESCRIPTOR_SIZE;
            put_u32(&mut bytes, at, lookup_rva);
            put_u32(&mut bytes, at + 12, name_rva);
            put_u32(&mut bytes, at + 16, first_thunk);

            if !iat.is_empty() {
                patches.push(Patch {
                    target: descriptor.first_thunk,
                    bytes: iat,
                });
            }
        }

        bytes.extend_from_slice(&strings.strings);
        pad_to(&mut bytes, 4);
        Ok(Encoded {
            bytes,
            absolute_fields: Vec::new(),
            patches,
        })
    }

    /// Descriptors importing `dll_name`, compared case-insensitively, with or without a
    /// `.dll` suffix.
    pub fn find<'a>(&'a self, dll_name: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.descriptors
            .iter()
            .enumerate()
            .filter(move |(_, descriptor)| dll_names_match(&descriptor.dll_name, dll_name))
            .map(|(index, _)| index)
    }

    /// Replace descriptor `index` by the result of splitting it around `resolved`.
    ///
    /// Out-of-range indices report [`SplitOutcome::Unchanged`].
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

/// Case-insensitive DLL name comparison that ignores a trailing `.dll`.
#[must_use]
pub fn dll_names_match(left: &str, right: &str) -> bool {
    fn stem(name: &str) -> String {
        let lower = name.to_ascii_lowercase();
        lower
            .strip_suffix(".dll")
            .map_or(lower.clone(), str::to_string)
    }
    stem(left) == stem(right)
}
