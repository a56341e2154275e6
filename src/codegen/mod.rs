//! Machine code generation for the entry trampoline.
//!
//! Code is assembled with `iced-x86`'s [`iced_x86::code_asm::CodeAssembler`] at the
//! virtual address it will run at, so relative calls and jumps into the image need no
//! relocation. Absolute addresses (IAT slots, data in the image, the headers) are
//! loaded with `mov reg, imm` and reported as [`Fixup`]s, which [`embed_blob`] turns into
//! base relocations.
//!
//! # Key Components
//!
//! - [`TrampolinePlan`] - what the stub has to do before handing over to the next entry
//! - [`assemble_trampoline`] - plan to [`CodeBlob`]
//! - [`embed_blob`] - place a blob as a new code section and register its fixups

mod trampoline;

pub use trampoline::{assemble_trampoline, EntryRestore, TlsSetup, TrampolinePlan};

use std::collections::BTreeSet;

use iced_x86::{Decoder, DecoderOptions, OpKind};
use log::debug;

use crate::{
    directories::relocations::RelocationType,
    image::{PeImage, Section, SectionFlags},
    Error, Result,
};

/// An absolute address inside a [`CodeBlob`] that must follow the image base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Offset of the address field from the start of the blob
    pub offset: u32,
    /// `HighLow` for 4-byte fields, `Dir64` for 8-byte ones
    pub kind: RelocationType,
}

/// Assembled code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlob {
    /// Virtual address the code was assembled for
    pub base_va: u64,
    /// Machine code
    pub bytes: Vec<u8>,
    /// Offset of the entry label
    pub entry_offset: u32,
    /// Absolute address fields
    pub fixups: Vec<Fixup>,
}

impl CodeBlob {
    /// Size of the code in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }
}

/// Where [`embed_blob`] puts a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Name of the new section
    pub name: String,
    /// RVA of the new section; must match the blob's `base_va`
    pub rva: u32,
}

/// Locate the immediates of `bytes` that hold one of `addresses`.
pub(crate) fn find_fixups(
    bytes: &[u8],
    bitness: u32,
    base_va: u64,
    addresses: &BTreeSet<u64>,
) -> Vec<Fixup> {
    let mut decoder = Decoder::with_ip(bitness, bytes, base_va, DecoderOptions::NONE);
    let mut fixups = Vec::new();

    while decoder.can_decode() {
        let instruction = decoder.decode();
        let offsets = decoder.get_constant_offsets(&instruction);
        if !offsets.has_immediate() {
            continue;
        }
        let value = (0..instruction.op_count()).find_map(|operand| {
            match instruction.op_kind(operand) {
                OpKind::Immediate32 => Some(u64::from(instruction.immediate32())),
                OpKind::Immediate64 => Some(instruction.immediate64()),
                _ => None,
            }
        });
        if !value.is_some_and(|value| addresses.contains(&value)) {
            continue;
        }

        let kind = match offsets.immediate_size() {
            4 => RelocationType::HighLow,
            8 => RelocationType::Dir64,
            _ => continue,
        };
        let start = instruction.ip() - base_va;
        let offset = start + offsets.immediate_offset() as u64;
        fixups.push(Fixup {
            offset: u32::try_from(offset).unwrap_or(u32::MAX),
            kind,
        });
    }
    fixups
}

/// Add `blob` to `image` as a final code section at `placement` and return the RVA of the
/// blob's entry label. Fixups become base relocations if the image is relocatable.
///
/// # Errors
/// Returns [`crate::Error::Internal`] if the blob was assembled for another address or
/// the section overlaps an existing one.
pub fn embed_blob(image: &mut PeImage, blob: &CodeBlob, placement: &Placement) -> Result<u32> {
    let expected = image.image_base() + u64::from(placement.rva);
    if blob.base_va != expected {
        return Err(internal_error!(
            "code assembled for {:#x} placed at {:#x}",
            blob.base_va,
            expected
        ));
    }

    image.sections_mut().place_section(Section::with_address(
        &placement.name,
        SectionFlags::CODE,
        placement.rva,
        blob.size(),
        blob.bytes.clone(),
    ))?;

    if image.is_relocatable() {
        if let Some(table) = image.relocations_mut() {
            for fixup in &blob.fixups {
                table.add(placement.rva + fixup.offset, fixup.kind);
            }
        }
    }

    let entry = placement
        .rva
        .checked_add(blob.entry_offset)
        .ok_or(Error::OutOfBounds)?;
    debug!(
        "placed {} ({:#x} bytes, {} fixups) at {:#x}",
        placement.name,
        blob.size(),
        blob.fixups.len(),
        placement.rva
    );
    Ok(entry)
}
