//! [`PeImage`] → bytes.
//!
//! Serialization runs in three passes over the image:
//!
//! 1. **Commit** - every dirty directory is measured, given space in an open data section,
//!    and once all open sections are placed, encoded at its final RVA. Absolute pointers
//!    in the encoded bytes become base relocations, and a dirty relocation table is
//!    encoded last into a section of its own.
//! 2. **Layout** - virtual gaps are closed, file offsets are assigned (original offsets
//!    are kept while they remain valid) and the header size is checked against the first
//!    section.
//! 3. **Emit** - the preserved header block is copied and the COFF header, optional
//!    header, data directory table, section table, section data and overlay are written
//!    over it. The checksum is recomputed if the input carried one.

use log::{debug, warn};
use strum::IntoEnumIterator;

use crate::{
    directories::{
        debug::{DebugData, DEBUG_ENTRY_SIZE, POINTER_TO_RAW_DATA_OFFSET},
        relocations::RelocationType,
        Directory, DirectoryKind, DirectoryLocation, EncodeContext, Encoded,
    },
    file::io::write_le_at,
    image::{
        headers::{
            compute_checksum, LayoutFields, CHECKSUM_OFFSET, COFF_HEADER_SIZE,
            E_LFANEW_OFFSET, PE_SIGNATURE,
        },
        Allocation, EntryPoint, LayoutOptions, PeImage, Section, SectionFlags,
        SECTION_HEADER_SIZE,
    },
    utils::align_up,
    Error, Result,
};

/// File layout decided by [`layout`].
struct FileLayout {
    size_of_headers: u32,
    raw_end: u32,
    /// Signed distance the overlay moved
    overlay_shift: i64,
    /// Any file offset changed compared to the input
    changed: bool,
}

pub(crate) fn write(image: &mut PeImage, options: &LayoutOptions) -> Result<Vec<u8>> {
    let was_modified = image.store.is_modified();
    let reencoded_debug = image.directories.is_dirty(DirectoryKind::Debug);
    commit(image, options)?;
    check_entry_point(image)?;

    let modified = was_modified || image.store.is_modified();
    if modified {
        image.store.close_gaps();
    }
    let layout = layout(image)?;
    if modified {
        update_size_fields(image);
    }
    if layout.changed || reencoded_debug {
        patch_debug_pointers(image, &layout)?;
    }

    let bytes = emit(image, &layout)?;
    image.store.clear_modified();
    Ok(bytes)
}

/// Number of section table entries the headers will hold if `extra` sections are added.
fn table_end(image: &PeImage, extra: usize) -> u32 {
    let count = u32::try_from(image.store.len() + extra).unwrap_or(u32::MAX);
    image.section_table_offset() + count * SECTION_HEADER_SIZE
}

fn any_dirty(image: &PeImage) -> bool {
    DirectoryKind::COMMIT_ORDER
        .iter()
        .any(|kind| image.directories.is_dirty(*kind))
        || image.directories.is_dirty(DirectoryKind::BaseRelocation)
}

/// Re-encode clean directories living in the header region that a grown section table
/// would overwrite.
fn invalidate_overlapped(image: &mut PeImage) {
    let table_start = image.section_table_offset();
    loop {
        let extra = if any_dirty(image) { 2 } else { 0 };
        let end = table_end(image, extra);

        let mut overlapped = Vec::new();
        for kind in DirectoryKind::COMMIT_ORDER {
            let slot = image.directories.slot(kind);
            let in_the_way = matches!(
                slot.location(),
                Some(DirectoryLocation::Unmapped { rva, size })
                    if *size > 0 && *rva < end && rva.saturating_add(*size) > table_start
            );
            match slot.directory() {
                Some(Directory::Raw { .. }) if in_the_way => {
                    warn!("uninterpreted {kind} directory will be overwritten by the section table");
                }
                Some(_) if in_the_way => overlapped.push(kind),
                _ => {}
            }
        }
        if overlapped.is_empty() {
            return;
        }
        for kind in overlapped {
            debug!("{kind} directory is in the way of the section table, moving it");
            let _ = image.directory_mut(kind);
        }
    }
}

fn commit(image: &mut PeImage, options: &LayoutOptions) -> Result<()> {
    invalidate_overlapped(image);

    let pe32_plus = image.optional.pe32_plus;
    let image_base = image.optional.image_base;
    let sizing = EncodeContext::sizing(image_base, pe32_plus);

    let mut pending: Vec<(DirectoryKind, Allocation)> = Vec::new();
    for kind in DirectoryKind::COMMIT_ORDER {
        if !image.directories.is_dirty(kind) {
            continue;
        }
        let Some(directory) = image.directories.get(kind) else {
            continue;
        };
        let alignment = directory.alignment(pe32_plus);
        let Some(encoded) = directory.encode(&sizing)? else {
            continue;
        };
        if encoded.size() == 0 {
            image
                .directories
                .set_location(kind, DirectoryLocation::Unmapped { rva: 0, size: 0 });
            continue;
        }

        let section = image.open_section(&options.data_section_name, SectionFlags::RDATA);
        let allocation = image.store.allocate(section, encoded.size(), alignment)?;
        debug!("reserved {:#x} bytes for the {kind} directory", encoded.size());
        pending.push((kind, allocation.clone()));
        image
            .directories
            .set_location(kind, DirectoryLocation::Section(allocation));
    }

    image.store.finalize_open_sections()?;

    let relocatable = image.is_relocatable();
    let mut relocations = Vec::new();
    for (kind, allocation) in pending {
        let data = allocation.data();
        let encoded = encode_at(image, kind, &allocation)?;
        write_encoded(image, &allocation, &encoded)?;
        if relocatable {
            let base = data.rva(&image.store);
            relocations.extend(encoded.absolute_fields.iter().map(|field| base + field));
        }
    }

    if !relocations.is_empty() {
        let kind = RelocationType::pointer(pe32_plus);
        if let Some(table) = image.relocations_mut() {
            for rva in relocations {
                table.add(rva, kind);
            }
        }
    }

    if image.directories.is_dirty(DirectoryKind::BaseRelocation) {
        commit_relocations(image, options)?;
    }
    Ok(())
}

/// Encode the directory of `kind` at the final RVA of `allocation`.
fn encode_at(image: &PeImage, kind: DirectoryKind, allocation: &Allocation) -> Result<Encoded> {
    let data = allocation.data();
    let rva = data
        .try_rva(&image.store)
        .ok_or_else(|| internal_error!("{kind} directory space has no final address"))?;
    let directory = image
        .directories
        .get(kind)
        .ok_or_else(|| internal_error!("{kind} directory vanished during commit"))?;

    let ctx = EncodeContext::new(
        &image.store,
        image.optional.image_base,
        image.optional.pe32_plus,
        rva,
    );
    let encoded = directory
        .encode(&ctx)?
        .ok_or_else(|| internal_error!("{kind} directory can not be encoded"))?;
    if Some(encoded.size()) != data.size() {
        return Err(internal_error!(
            "{kind} directory changed size from {:#x} to {:#x}",
            data.size().unwrap_or(0),
            encoded.size()
        ));
    }
    Ok(encoded)
}

fn write_encoded(image: &mut PeImage, allocation: &Allocation, encoded: &Encoded) -> Result<()> {
    let data = allocation.data();
    let section = data
        .section_id()
        .and_then(|id| image.store.get_mut(id))
        .ok_or_else(|| internal_error!("directory space in a removed section"))?;
    section.write(data.offset(), &encoded.bytes)?;

    for patch in &encoded.patches {
        let section = patch
            .target
            .section_id()
            .and_then(|id| image.store.get_mut(id))
            .ok_or_else(|| internal_error!("patch into a removed section"))?;
        section.write(patch.target.offset(), &patch.bytes)?;
    }
    Ok(())
}

fn commit_relocations(image: &mut PeImage, options: &LayoutOptions) -> Result<()> {
    let sizing = EncodeContext::sizing(image.optional.image_base, image.optional.pe32_plus);
    let size = match image.directories.get(DirectoryKind::BaseRelocation) {
        Some(directory) => directory.encode(&sizing)?.map_or(0, |encoded| encoded.size()),
        None => 0,
    };
    if size == 0 {
        image.directories.set_location(
            DirectoryKind::BaseRelocation,
            DirectoryLocation::Unmapped { rva: 0, size: 0 },
        );
        return Ok(());
    }

    let flags = SectionFlags::CNT_INITIALIZED_DATA
        | SectionFlags::MEM_READ
        | SectionFlags::MEM_DISCARDABLE;
    let section = image
        .store
        .add_section(Section::new(&options.relocation_section_name, flags));
    let allocation = image.store.allocate(section, size, 4)?;
    image.store.finalize_open_sections()?;

    let encoded = encode_at(image, DirectoryKind::BaseRelocation, &allocation)?;
    write_encoded(image, &allocation, &encoded)?;
    debug!(
        "relocation table re-encoded at {:#x}",
        allocation.data().rva(&image.store)
    );
    image.directories.set_location(
        DirectoryKind::BaseRelocation,
        DirectoryLocation::Section(allocation),
    );
    Ok(())
}

fn check_entry_point(image: &PeImage) -> Result<()> {
    if image.coff.is_dll() {
        return Ok(());
    }
    match image.entry_point {
        EntryPoint::Mapped(data) if data.try_rva(&image.store).is_some() => Ok(()),
        EntryPoint::Unmapped(_) => Ok(()),
        _ => Err(Error::MissingEntryPoint),
    }
}

fn layout(image: &mut PeImage) -> Result<FileLayout> {
    let file_alignment = image.optional.file_alignment.max(1);
    let needed = table_end(image, 0);
    let aligned = align_up(needed, file_alignment);
    let size_of_headers = if aligned <= image.size_of_headers {
        image.size_of_headers
    } else {
        aligned
    };

    let first_section = image
        .store
        .iter()
        .filter_map(|(_, section)| section.virtual_address())
        .min();
    if let Some(limit) = first_section {
        if size_of_headers > limit && size_of_headers != image.size_of_headers {
            return Err(Error::HeaderOverflow {
                needed: size_of_headers,
                limit,
            });
        }
    }
    image.store.set_header_size(size_of_headers);

    let mut changed = size_of_headers != image.size_of_headers;
    let mut cursor = align_up(size_of_headers, file_alignment);
    for id in image.store.ids() {
        let Some(section) = image.store.get_mut(id) else {
            continue;
        };
        let data_len = section.stored_len();
        let original = *section.raw_info();

        let size_of_raw_data = if data_len == original.size_of_raw_data {
            original.size_of_raw_data
        } else {
            align_up(data_len, file_alignment)
        };
        let pointer_to_raw_data = if size_of_raw_data == 0 {
            original.pointer_to_raw_data
        } else if original.pointer_to_raw_data >= cursor {
            original.pointer_to_raw_data
        } else {
            cursor
        };

        if size_of_raw_data != original.size_of_raw_data
            || pointer_to_raw_data != original.pointer_to_raw_data
        {
            changed = true;
            let raw = section.raw_info_mut();
            raw.size_of_raw_data = size_of_raw_data;
            raw.pointer_to_raw_data = pointer_to_raw_data;
        }
        if size_of_raw_data != 0 {
            cursor = align_up(
                cursor.max(pointer_to_raw_data + size_of_raw_data),
                file_alignment,
            );
        }
    }

    let raw_end = match image.raw_end {
        Some(previous) if !changed => previous.max(size_of_headers),
        _ => cursor.max(size_of_headers),
    };
    let overlay_shift = image
        .overlay_origin
        .map_or(0, |origin| i64::from(raw_end) - i64::from(origin));
    if overlay_shift != 0 {
        debug!("overlay moved by {overlay_shift:#x} bytes");
    }

    Ok(FileLayout {
        size_of_headers,
        raw_end,
        overlay_shift,
        changed: changed || overlay_shift != 0,
    })
}

fn update_size_fields(image: &mut PeImage) {
    let mut size_of_code = 0u32;
    let mut size_of_initialized_data = 0u32;
    let mut size_of_uninitialized_data = 0u32;
    let mut base_of_code = None;
    let mut base_of_data = None;

    for (_, section) in image.store.iter() {
        let flags = section.characteristics();
        let raw = section.raw_info().size_of_raw_data;
        let va = section.virtual_address().unwrap_or(0);
        if flags.contains(SectionFlags::CNT_CODE) {
            size_of_code = size_of_code.saturating_add(raw);
            base_of_code.get_or_insert(va);
        }
        if flags.contains(SectionFlags::CNT_INITIALIZED_DATA) {
            size_of_initialized_data = size_of_initialized_data.saturating_add(raw);
            if !flags.contains(SectionFlags::CNT_CODE) {
                base_of_data.get_or_insert(va);
            }
        }
        if flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA) {
            size_of_uninitialized_data =
                size_of_uninitialized_data.saturating_add(section.virtual_size());
        }
    }

    let optional = &mut image.optional;
    optional.size_of_code = size_of_code;
    optional.size_of_initialized_data = size_of_initialized_data;
    optional.size_of_uninitialized_data = size_of_uninitialized_data;
    optional.base_of_code = base_of_code.unwrap_or(0);
    if !optional.pe32_plus {
        optional.base_of_data = base_of_data.unwrap_or(0);
    }
}

/// File offset of `rva` in the current layout, `None` if it has no file backing.
fn file_offset_of(image: &PeImage, rva: u32) -> Option<u32> {
    let (id, offset) = image.store.find_section_by_rva(rva, 1)?;
    let raw = image.store.get(id)?.raw_info();
    (offset < raw.size_of_raw_data).then(|| raw.pointer_to_raw_data + offset)
}

fn shifted(offset: u32, image: &PeImage, shift: i64) -> u32 {
    match image.overlay_origin {
        Some(origin) if offset >= origin => {
            u32::try_from(i64::from(offset) + shift).unwrap_or(offset)
        }
        _ => offset,
    }
}

/// Rewrite `PointerToRawData` of every debug entry for the final layout.
fn patch_debug_pointers(image: &mut PeImage, layout: &FileLayout) -> Result<()> {
    let Some(Directory::Debug(directory)) = image.directories.get(DirectoryKind::Debug) else {
        return Ok(());
    };
    let Some(location) = image.directories.slot(DirectoryKind::Debug).location() else {
        return Ok(());
    };

    let pointers: Vec<u32> = directory
        .entries
        .iter()
        .map(|entry| match entry.data {
            DebugData::None => 0,
            DebugData::Mapped(data) => data
                .try_rva(&image.store)
                .and_then(|rva| file_offset_of(image, rva))
                .unwrap_or(0),
            DebugData::Unmapped { file_offset } => {
                shifted(file_offset, image, layout.overlay_shift)
            }
        })
        .collect();
    let location = location.clone();

    for (index, pointer) in pointers.into_iter().enumerate() {
        let at = u32::try_from(index).unwrap_or(u32::MAX) * DEBUG_ENTRY_SIZE
            + POINTER_TO_RAW_DATA_OFFSET;
        let bytes = pointer.to_le_bytes();
        match &location {
            DirectoryLocation::Section(allocation) => {
                let data = allocation.data();
                if let Some(section) = data.section_id().and_then(|id| image.store.get_mut(id)) {
                    section.write(data.offset() + at, &bytes)?;
                }
            }
            DirectoryLocation::Unmapped { rva, size } if *size > 0 => {
                let start = (*rva + at) as usize;
                if let Some(slot) = image.header_block.get_mut(start..start + 4) {
                    slot.copy_from_slice(&bytes);
                } else {
                    warn!("debug directory at {rva:#x} is outside the headers, not patched");
                }
            }
            DirectoryLocation::Unmapped { .. } => {}
        }
    }
    Ok(())
}

fn emit(image: &mut PeImage, layout: &FileLayout) -> Result<Vec<u8>> {
    let size_of_headers = layout.size_of_headers as usize;
    let total = layout.raw_end as usize + image.overlay.len();
    let mut out = vec![0u8; total.max(size_of_headers)];

    let preserved = image.header_block.len().min(size_of_headers);
    out[..preserved].copy_from_slice(&image.header_block[..preserved]);

    let pe_offset = image.pe_offset as usize;
    let mut offset = E_LFANEW_OFFSET;
    write_le_at(&mut out, &mut offset, image.pe_offset)?;
    let mut offset = pe_offset;
    write_le_at(&mut out, &mut offset, PE_SIGNATURE)?;

    let count = u16::try_from(image.store.len())
        .map_err(|_| malformed_error!("{} sections exceed the COFF limit", image.store.len()))?;
    image.coff.write(&mut out, pe_offset + 4, count)?;

    let entry_point = match image.entry_point {
        EntryPoint::None => 0,
        EntryPoint::Mapped(data) => data.rva(&image.store),
        EntryPoint::Unmapped(rva) => rva,
    };
    let directories = DirectoryKind::iter()
        .map(|kind| {
            match image.directories.get(kind) {
                Some(Directory::Certificates { file_offset, size }) => {
                    (shifted(*file_offset, image, layout.overlay_shift), *size)
                }
                _ => image.directories.table_entry(kind, &image.store),
            }
        })
        .collect();
    let fields = LayoutFields {
        entry_point,
        size_of_image: image.store.image_end(),
        size_of_headers: layout.size_of_headers,
        directories,
    };
    let optional_offset = pe_offset + 4 + COFF_HEADER_SIZE as usize;
    image.optional.write(
        &mut out,
        optional_offset,
        image.coff.size_of_optional_header,
        &fields,
    )?;

    let mut offset = image.section_table_offset() as usize;
    for (_, section) in image.store.iter() {
        let raw = section.raw_info();
        out.get_mut(offset..offset + 8)
            .ok_or(Error::OutOfBounds)?
            .copy_from_slice(section.name_bytes());
        offset += 8;
        write_le_at(&mut out, &mut offset, section.virtual_size())?;
        write_le_at(&mut out, &mut offset, section.virtual_address().unwrap_or(0))?;
        write_le_at(&mut out, &mut offset, raw.size_of_raw_data)?;
        write_le_at(&mut out, &mut offset, raw.pointer_to_raw_data)?;
        write_le_at(&mut out, &mut offset, raw.pointer_to_relocations)?;
        write_le_at(&mut out, &mut offset, raw.pointer_to_linenumbers)?;
        write_le_at(&mut out, &mut offset, raw.number_of_relocations)?;
        write_le_at(&mut out, &mut offset, raw.number_of_linenumbers)?;
        write_le_at(&mut out, &mut offset, section.characteristics().bits())?;
    }

    // Entries of removed sections must not survive in the preserved header bytes.
    let stale_end = (image.section_table_offset() as usize
        + image.original_section_count * SECTION_HEADER_SIZE as usize)
        .min(size_of_headers);
    if offset < stale_end {
        out[offset..stale_end].fill(0);
    }

    for (_, section) in image.store.iter() {
        let raw = section.raw_info();
        if raw.size_of_raw_data == 0 {
            continue;
        }
        let start = raw.pointer_to_raw_data as usize;
        let len = section.data().len().min(raw.size_of_raw_data as usize);
        out.get_mut(start..start + len)
            .ok_or(Error::OutOfBounds)?
            .copy_from_slice(&section.data()[..len]);
    }

    let overlay_start = layout.raw_end as usize;
    out[overlay_start..overlay_start + image.overlay.len()].copy_from_slice(&image.overlay);

    if image.optional.checksum != 0 {
        let checksum_offset = optional_offset + CHECKSUM_OFFSET as usize;
        let checksum = compute_checksum(&out, checksum_offset);
        let mut offset = checksum_offset;
        write_le_at(&mut out, &mut offset, checksum)?;
        image.optional.checksum = checksum;
    }

    image.size_of_headers = layout.size_of_headers;
    image.original_section_count = image.store.len();
    image.raw_end = Some(layout.raw_end);
    image.header_block = out[..size_of_headers].to_vec();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directories::relocations::RelocationTable,
        image::headers::{ImageKind, Machine},
    };

    fn dll_with_text() -> PeImage {
        let mut image = PeImage::new(Machine::I386, ImageKind::Dll);
        image
            .sections_mut()
            .place_section(Section::with_address(
                ".text",
                SectionFlags::CODE,
                0x1000,
                0x10,
                vec![0xC3; 0x10],
            ))
            .unwrap();
        image
    }

    #[test]
    fn new_image_serializes_and_reparses() {
        let mut image = dll_with_text();
        let bytes = image.to_bytes().unwrap();
        assert_eq!(bytes.len(), 0x400);

        let parsed = PeImage::parse(&bytes).unwrap();
        assert_eq!(parsed.sections().len(), 1);
        assert_eq!(parsed.size_of_image(), 0x2000);
        assert_eq!(parsed.optional().size_of_code, 0x200);
        assert_eq!(parsed.optional().base_of_code, 0x1000);
        let (_, text) = parsed.sections().iter().next().unwrap();
        assert_eq!(text.raw_info().pointer_to_raw_data, 0x200);
        assert_eq!(&text.data()[..0x10], &[0xC3; 0x10]);

        let mut again = parsed.clone();
        assert_eq!(again.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn executable_needs_entry_point() {
        let mut image = PeImage::new(Machine::I386, ImageKind::Executable);
        assert!(matches!(image.to_bytes(), Err(Error::MissingEntryPoint)));
    }

    #[test]
    fn dirty_relocations_go_to_a_new_section() {
        let mut image = dll_with_text();
        let mut table = RelocationTable::new();
        table.add(0x1004, RelocationType::HighLow);
        image.set_directory(
            DirectoryKind::BaseRelocation,
            Some(Directory::Relocations(table)),
        );

        let bytes = image.to_bytes().unwrap();
        let parsed = PeImage::parse(&bytes).unwrap();
        let reloc = parsed.sections().find_by_name(".reloc").unwrap();
        assert_eq!(
            parsed.sections().get(reloc).unwrap().virtual_address(),
            Some(0x2000)
        );
        assert_eq!(
            parsed.relocations().unwrap().get(0x1004),
            Some(RelocationType::HighLow)
        );
        assert!(!parsed.directories().is_dirty(DirectoryKind::BaseRelocation));
    }
}
