//! Bytes → [`PeImage`].

use log::debug;
use strum::IntoEnumIterator;

use crate::{
    directories::{
        bound::BoundImportDirectory, debug::DebugDirectory, delay::DelayImportDirectory,
        exceptions::ExceptionTable, exports::ExportDirectory, imports::ImportDirectory,
        relocations::RelocationTable, resources::ResourceDirectory, tls::TlsDirectory,
        DataDirectories, Directory, DirectoryKind, DirectoryLocation, ParseContext, RawData,
    },
    file::{io::read_le_at, parser::Parser},
    image::{
        headers::{CoffHeader, OptionalHeader, DOS_MAGIC, E_LFANEW_OFFSET, PE_SIGNATURE},
        Allocation, EntryPoint, PeImage, RawSectionInfo, Section, SectionStore,
        SECTION_HEADER_SIZE,
    },
    Error, Result,
};

pub(crate) fn parse(data: &[u8]) -> Result<PeImage> {
    if data.is_empty() {
        return Err(Error::Empty);
    }
    if data.len() < E_LFANEW_OFFSET + 4 {
        return Err(malformed_error!("File of {} bytes is too small", data.len()));
    }

    let mut offset = 0;
    if read_le_at::<u16>(data, &mut offset)? != DOS_MAGIC {
        return Err(malformed_error!("Missing MZ signature"));
    }
    let mut offset = E_LFANEW_OFFSET;
    let pe_offset = read_le_at::<u32>(data, &mut offset)?;

    let mut parser = Parser::new(data);
    parser.seek(pe_offset as usize)?;
    if parser.read_le::<u32>()? != PE_SIGNATURE {
        return Err(malformed_error!("Missing PE signature at {:#x}", pe_offset));
    }

    let (coff, number_of_sections) = CoffHeader::parse(&mut parser)?;
    let optional_start = parser.pos();
    let (optional, layout) = OptionalHeader::parse(&mut parser, coff.size_of_optional_header)?;
    let table_offset = optional_start + usize::from(coff.size_of_optional_header);
    let table_end = table_offset + usize::from(number_of_sections) * SECTION_HEADER_SIZE as usize;
    if table_end > data.len() {
        return Err(malformed_error!(
            "Section table of {} entries exceeds the file",
            number_of_sections
        ));
    }

    let header_end = (layout.size_of_headers as usize)
        .max(table_end)
        .min(data.len());
    let header_block = data[..header_end].to_vec();

    let mut store = SectionStore::new(optional.section_alignment, layout.size_of_headers);
    let mut raw_end = header_end;
    parser.seek(table_offset)?;
    for _ in 0..number_of_sections {
        let name: [u8; 8] = parser
            .read_bytes(8)?
            .try_into()
            .map_err(|_| Error::OutOfBounds)?;
        let virtual_size = parser.read_le::<u32>()?;
        let virtual_address = parser.read_le::<u32>()?;
        let raw = RawSectionInfo {
            size_of_raw_data: parser.read_le::<u32>()?,
            pointer_to_raw_data: parser.read_le::<u32>()?,
            pointer_to_relocations: parser.read_le::<u32>()?,
            pointer_to_linenumbers: parser.read_le::<u32>()?,
            number_of_relocations: parser.read_le::<u16>()?,
            number_of_linenumbers: parser.read_le::<u16>()?,
        };
        let characteristics = parser.read_le::<u32>()?;

        let start = raw.pointer_to_raw_data as usize;
        let bytes = if raw.size_of_raw_data == 0 || start >= data.len() {
            Vec::new()
        } else {
            let end = (start + raw.size_of_raw_data as usize).min(data.len());
            raw_end = raw_end.max(end);
            data[start..end].to_vec()
        };

        let section = Section::from_header(
            name,
            characteristics,
            virtual_address,
            virtual_size,
            bytes,
            raw,
        );
        debug!(
            "section {} at {:#x}+{:#x}, raw {:#x}+{:#x}",
            section.name(),
            virtual_address,
            virtual_size,
            raw.pointer_to_raw_data,
            raw.size_of_raw_data
        );
        // The file's layout is authoritative, overlapping sections included.
        store.add_section(section);
    }
    store.clear_modified();

    let entry_point = match layout.entry_point {
        0 => EntryPoint::None,
        rva => match store.data_ref(rva, 1) {
            Some(data) => EntryPoint::Mapped(data),
            None => EntryPoint::Unmapped(rva),
        },
    };

    let directories = parse_directories(
        &store,
        &header_block,
        &optional,
        coff.machine,
        &layout.directories,
    )?;

    let raw_end_u32 = u32::try_from(raw_end).map_err(|_| Error::OutOfBounds)?;
    Ok(PeImage {
        header_block,
        pe_offset,
        coff,
        optional,
        size_of_headers: layout.size_of_headers,
        original_section_count: usize::from(number_of_sections),
        entry_point,
        store,
        directories,
        overlay: data[raw_end..].to_vec(),
        overlay_origin: Some(raw_end_u32),
        raw_end: Some(raw_end_u32),
    })
}

fn parse_directories(
    store: &SectionStore,
    header: &[u8],
    optional: &OptionalHeader,
    machine: u16,
    table: &[(u32, u32)],
) -> Result<DataDirectories> {
    let ctx = ParseContext::new(
        store,
        header,
        optional.image_base,
        optional.pe32_plus,
        machine,
    );
    let mut directories = DataDirectories::default();

    for kind in DirectoryKind::iter() {
        let Some((rva, size)) = table.get(kind.index()).copied() else {
            break;
        };
        if rva == 0 && size == 0 {
            continue;
        }

        if kind == DirectoryKind::Certificate {
            directories.set_clean(
                kind,
                Directory::Certificates {
                    file_offset: rva,
                    size,
                },
                DirectoryLocation::Unmapped { rva, size },
            );
            continue;
        }

        let location = match store.data_ref(rva, size.max(1)) {
            Some(data) => DirectoryLocation::Section(Allocation::unclaimed(data.with_size(size))),
            None => DirectoryLocation::Unmapped { rva, size },
        };

        // A slot with a size but no address carries nothing to interpret.
        let directory = if rva == 0 {
            None
        } else {
            parse_directory(&ctx, kind, rva, size).map_err(|error| match error {
                Error::Malformed {
                    message,
                    file,
                    line,
                } => Error::Malformed {
                    message: format!("{kind} directory at {rva:#x}: {message}"),
                    file,
                    line,
                },
                other => other,
            })?
        };

        let directory = directory.unwrap_or_else(|| Directory::Raw {
            data: match store.data_ref(rva, size.max(1)) {
                Some(data) if rva != 0 => RawData::Mapped(data.with_size(size)),
                _ => RawData::Unmapped(rva),
            },
            size,
        });
        debug!("parsed {} directory at {:#x}+{:#x}", directory.name(), rva, size);
        directories.set_clean(kind, directory, location);
    }
    Ok(directories)
}

/// Parse one interpreted directory; `None` for kinds kept as raw ranges.
fn parse_directory(
    ctx: &ParseContext,
    kind: DirectoryKind,
    rva: u32,
    size: u32,
) -> Result<Option<Directory>> {
    let directory = match kind {
        DirectoryKind::Export => Directory::Exports(ExportDirectory::parse(ctx, rva, size)?),
        DirectoryKind::Import => Directory::Imports(ImportDirectory::parse(ctx, rva, size)?),
        DirectoryKind::Resource => {
            Directory::Resources(ResourceDirectory::parse(ctx, rva, size)?)
        }
        DirectoryKind::Exception => Directory::Exceptions(ExceptionTable::parse(ctx, rva, size)?),
        DirectoryKind::BaseRelocation => {
            Directory::Relocations(RelocationTable::parse(ctx, rva, size)?)
        }
        DirectoryKind::Debug => Directory::Debug(DebugDirectory::parse(ctx, rva, size)?),
        DirectoryKind::Tls => Directory::Tls(TlsDirectory::parse(ctx, rva, size)?),
        DirectoryKind::BoundImport => {
            Directory::BoundImports(BoundImportDirectory::parse(ctx, rva, size)?)
        }
        DirectoryKind::DelayImport => {
            Directory::DelayImports(DelayImportDirectory::parse(ctx, rva, size)?)
        }
        DirectoryKind::Certificate
        | DirectoryKind::Architecture
        | DirectoryKind::GlobalPtr
        | DirectoryKind::LoadConfig
        | DirectoryKind::Iat
        | DirectoryKind::ClrRuntime
        | DirectoryKind::Reserved => return Ok(None),
    };
    Ok(Some(directory))
}
