//! The PE image model.
//!
//! A [`PeImage`] is the in-memory form of one PE/PE32+ file. It owns the header block
//! (DOS header, stub and everything up to `SizeOfHeaders`, preserved verbatim), the COFF
//! and optional header fields, the sections, the 16 data directory slots and the overlay.
//! Images are parsed from bytes, mutated in place and written back with
//! [`PeImage::to_bytes`].
//!
//! # Architecture
//!
//! Sections live in a [`SectionStore`] arena and are addressed by [`SectionId`] handles.
//! Everything that points into a section (directory contents, the entry point, TLS
//! callbacks, ...) is a [`DataRef`]: a section handle plus a section-relative offset.
//! Because no raw RVA is stored anywhere, sections can be added, placed and moved freely
//! until the image is serialized, and the writer derives every RVA and file offset from
//! the final layout.
//!
//! # Key Components
//!
//! - [`PeImage`] - the image, with typed directory accessors
//! - [`SectionStore`] / [`Section`] - section arena and sections
//! - [`DataRef`] / [`SectionRef`] / [`Allocation`] - handles into sections
//! - [`headers`] - COFF and optional header fields
//! - [`LayoutOptions`] - names of the sections the writer creates
//!
//! # Examples
//!
//! ```rust,no_run
//! use peweld::PeImage;
//! use std::path::Path;
//!
//! let mut image = PeImage::from_file(Path::new("host.exe"))?;
//! for (_, section) in image.sections().iter() {
//!     println!("{:8} {:#x}", section.name(), section.virtual_address().unwrap_or(0));
//! }
//! let bytes = image.to_bytes()?;
//! # Ok::<(), peweld::Error>(())
//! ```

use log::debug;

pub mod allocator;
pub mod headers;
mod reader;
mod reference;
mod section;
mod store;
mod writer;

use std::path::Path;

use crate::{
    directories::{
        bound::BoundImportDirectory, debug::DebugDirectory, delay::DelayImportDirectory,
        exceptions::ExceptionTable, exports::ExportDirectory, imports::ImportDirectory,
        relocations::RelocationTable, resources::ResourceDirectory, tls::TlsDirectory,
        DataDirectories, Directory, DirectoryKind, DirectoryLocation,
    },
    file::{
        io::{read_le, write_le, PeIO},
        output::Output,
        File,
    },
    Error, Result,
};

use self::headers::{
    default_dos_header, CoffHeader, FileCharacteristics, ImageKind, Machine, OptionalHeader,
    COFF_HEADER_SIZE,
};

pub use allocator::AddressSpaceAllocator;
pub use reference::{Allocation, DataRef, SectionId, SectionRef};
pub use section::{RawSectionInfo, Section, SectionFlags, SectionPhase, SECTION_HEADER_SIZE};
pub use store::SectionStore;

/// Where execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `AddressOfEntryPoint` is zero
    None,
    /// Inside a section
    Mapped(DataRef),
    /// An RVA outside every section, kept verbatim
    Unmapped(u32),
}

/// Names of the sections the writer creates when directories must be re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutOptions {
    /// Section receiving re-encoded directories
    pub data_section_name: String,
    /// Section receiving a re-encoded base relocation table
    pub relocation_section_name: String,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        LayoutOptions {
            data_section_name: ".pedata".to_string(),
            relocation_section_name: ".reloc".to_string(),
        }
    }
}

/// One PE/PE32+ image.
#[derive(Debug, Clone)]
pub struct PeImage {
    /// Bytes from offset 0 up to `SizeOfHeaders` (or the end of the section table)
    header_block: Vec<u8>,
    /// `e_lfanew`
    pe_offset: u32,
    coff: CoffHeader,
    optional: OptionalHeader,
    /// `SizeOfHeaders` as read, `0` for new images
    size_of_headers: u32,
    /// Section table entries present in the header block
    original_section_count: usize,
    entry_point: EntryPoint,
    store: SectionStore,
    directories: DataDirectories,
    overlay: Vec<u8>,
    /// File offset the overlay was read from; unmapped file offsets are relative to it
    overlay_origin: Option<u32>,
    /// End of section data as last read or written
    raw_end: Option<u32>,
}

macro_rules! typed_directory {
    ($get:ident, $get_mut:ident, $kind:expr, $variant:ident, $ty:ty) => {
        #[doc = concat!("The `", stringify!($variant), "` directory, if present.")]
        #[must_use]
        pub fn $get(&self) -> Option<&$ty> {
            match self.directories.get($kind) {
                Some(Directory::$variant(directory)) => Some(directory),
                _ => None,
            }
        }

        #[doc = concat!("Mutable `", stringify!($variant), "` directory; marks it for re-encoding.")]
        pub fn $get_mut(&mut self) -> Option<&mut $ty> {
            match self.directory_mut($kind) {
                Some(Directory::$variant(directory)) => Some(directory),
                _ => None,
            }
        }
    };
}

impl PeImage {
    /// An empty image of `kind` for `machine`, with default headers and no sections.
    #[must_use]
    pub fn new(machine: Machine, kind: ImageKind) -> Self {
        let optional = OptionalHeader::new(machine, kind);
        let mut characteristics = FileCharacteristics::EXECUTABLE_IMAGE;
        if machine.is_64bit() {
            characteristics |= FileCharacteristics::LARGE_ADDRESS_AWARE;
        } else {
            characteristics |= FileCharacteristics::MACHINE_32BIT;
        }
        if kind == ImageKind::Dll {
            characteristics |= FileCharacteristics::DLL;
        }

        let coff = CoffHeader {
            machine: machine as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: optional.standard_size(),
            characteristics,
        };
        let header_block = default_dos_header();
        let pe_offset = u32::try_from(header_block.len()).unwrap_or(0x80);
        let store = SectionStore::new(optional.section_alignment, optional.file_alignment);

        PeImage {
            header_block,
            pe_offset,
            coff,
            optional,
            size_of_headers: 0,
            original_section_count: 0,
            entry_point: EntryPoint::None,
            store,
            directories: DataDirectories::default(),
            overlay: Vec::new(),
            overlay_origin: None,
            raw_end: None,
        }
    }

    /// Parse an image from bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for empty input, [`crate::Error::Malformed`] if the
    /// DOS or PE signature is missing or a header is corrupt, and
    /// [`crate::Error::OutOfBounds`] for truncated headers. Directories that fail to parse
    /// are kept as opaque ranges.
    pub fn parse(data: &[u8]) -> Result<Self> {
        reader::parse(data)
    }

    /// Parse an image from a file on disk.
    ///
    /// # Errors
    /// See [`PeImage::parse`]; I/O failures are reported as [`crate::Error::FileError`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::from_file(path)?;
        Self::parse(file.data())
    }

    /// Parse an image from an owned buffer.
    ///
    /// # Errors
    /// See [`PeImage::parse`].
    pub fn from_mem(data: Vec<u8>) -> Result<Self> {
        let file = File::from_mem(data)?;
        Self::parse(file.data())
    }

    /// Commit pending changes and serialize with the default [`LayoutOptions`].
    ///
    /// Committing re-encodes every directory that was modified, places all open sections
    /// and recomputes the layout-dependent header fields. The image stays usable and a
    /// second call without further changes yields the same bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingEntryPoint`] for executables without a resolvable
    /// entry point, [`crate::Error::HeaderOverflow`] if the section table no longer fits,
    /// [`crate::Error::NoAddressSpace`] if the image outgrows the RVA space and
    /// [`crate::Error::Internal`] for unresolvable references.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.to_bytes_with(&LayoutOptions::default())
    }

    /// Commit pending changes and serialize.
    ///
    /// # Errors
    /// See [`PeImage::to_bytes`].
    pub fn to_bytes_with(&mut self, options: &LayoutOptions) -> Result<Vec<u8>> {
        writer::write(self, options)
    }

    /// Serialize into `path`. The file is only left behind if writing succeeded.
    ///
    /// # Errors
    /// See [`PeImage::to_bytes`]; output failures are reported as
    /// [`crate::Error::WriteMmapFailed`] or [`crate::Error::WriteFinalizationFailed`].
    pub fn write_to_file(&mut self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut output = Output::create(path, bytes.len() as u64)?;
        output.write_at(0, &bytes)?;
        output.finalize()
    }

    /// COFF header fields.
    #[must_use]
    pub fn coff(&self) -> &CoffHeader {
        &self.coff
    }

    /// Mutable COFF header fields.
    pub fn coff_mut(&mut self) -> &mut CoffHeader {
        &mut self.coff
    }

    /// Optional header fields.
    #[must_use]
    pub fn optional(&self) -> &OptionalHeader {
        &self.optional
    }

    /// Mutable optional header fields.
    pub fn optional_mut(&mut self) -> &mut OptionalHeader {
        &mut self.optional
    }

    /// `IMAGE_FILE_MACHINE_*` value.
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.coff.machine
    }

    /// Returns `true` for DLLs.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.coff.is_dll()
    }

    /// Executable or library.
    #[must_use]
    pub fn kind(&self) -> ImageKind {
        if self.coff.is_dll() {
            ImageKind::Dll
        } else {
            ImageKind::Executable
        }
    }

    /// Returns `true` for PE32+ images.
    #[must_use]
    pub fn is_pe32_plus(&self) -> bool {
        self.optional.pe32_plus
    }

    /// Pointer size, 4 or 8.
    #[must_use]
    pub fn ptr_size(&self) -> u32 {
        self.optional.ptr_size()
    }

    /// Preferred load address.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.optional.image_base
    }

    /// `SizeOfImage` of the current layout.
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.store.image_end()
    }

    /// Offset of the `PE\0\0` signature.
    #[must_use]
    pub fn pe_offset(&self) -> u32 {
        self.pe_offset
    }

    /// Returns `true` if the image can be loaded at another base: it carries a base
    /// relocation table and is not marked as stripped.
    #[must_use]
    pub fn is_relocatable(&self) -> bool {
        self.relocations().is_some()
            && !self
                .coff
                .characteristics
                .contains(FileCharacteristics::RELOCS_STRIPPED)
    }

    /// The entry point.
    #[must_use]
    pub fn entry_point(&self) -> EntryPoint {
        self.entry_point
    }

    /// RVA of the entry point in the current layout, `None` if absent or unresolvable.
    #[must_use]
    pub fn entry_point_rva(&self) -> Option<u32> {
        match self.entry_point {
            EntryPoint::None => None,
            EntryPoint::Mapped(data) => data.try_rva(&self.store),
            EntryPoint::Unmapped(rva) => Some(rva),
        }
    }

    /// Make `entry` the entry point.
    pub fn set_entry_point(&mut self, entry: DataRef) {
        self.entry_point = if entry.is_null() {
            EntryPoint::None
        } else {
            EntryPoint::Mapped(entry)
        };
    }

    /// The sections.
    #[must_use]
    pub fn sections(&self) -> &SectionStore {
        &self.store
    }

    /// Mutable access to the sections.
    pub fn sections_mut(&mut self) -> &mut SectionStore {
        &mut self.store
    }

    /// Bytes after the last section.
    #[must_use]
    pub fn overlay(&self) -> &[u8] {
        &self.overlay
    }

    /// Replace the overlay.
    pub fn set_overlay(&mut self, overlay: Vec<u8>) {
        self.overlay = overlay;
    }

    /// Header bytes up to `SizeOfHeaders` as read.
    #[must_use]
    pub fn header_block(&self) -> &[u8] {
        &self.header_block
    }

    /// The data directory slots.
    #[must_use]
    pub fn directories(&self) -> &DataDirectories {
        &self.directories
    }

    /// Directory of `kind`, if present.
    #[must_use]
    pub fn directory(&self, kind: DirectoryKind) -> Option<&Directory> {
        self.directories.get(kind)
    }

    /// Mutable directory access. The slot is marked for re-encoding and the space its
    /// bytes occupied in a section created by this crate is given back.
    pub fn directory_mut(&mut self, kind: DirectoryKind) -> Option<&mut Directory> {
        let (_, released) = self.directories.get_mut(kind);
        if let Some(location) = released {
            self.abandon_location(kind, location);
        }
        self.directories.get_mut(kind).0
    }

    /// Replace (or with `None`, remove) the directory of `kind`.
    pub fn set_directory(&mut self, kind: DirectoryKind, directory: Option<Directory>) {
        if let Some(location) = self.directories.set(kind, directory) {
            self.abandon_location(kind, location);
        }
    }

    /// The bytes of `kind` at `location` are dead: drop the base relocations of its
    /// absolute fields and give its space back.
    fn abandon_location(&mut self, kind: DirectoryKind, location: DirectoryLocation) {
        // The certificate "RVA" is a file offset
        if !matches!(
            kind,
            DirectoryKind::BaseRelocation | DirectoryKind::Certificate
        ) {
            let range = match &location {
                DirectoryLocation::Section(allocation) => {
                    let data = allocation.data();
                    data.try_rva(&self.store).zip(data.size())
                }
                DirectoryLocation::Unmapped { rva, size } => Some((*rva, *size)),
            };
            if let Some((start, size)) = range {
                self.drop_relocations(start, start.saturating_add(size));
            }
        }
        if let DirectoryLocation::Section(allocation) = location {
            self.store.release(allocation);
        }
    }

    fn drop_relocations(&mut self, start: u32, end: u32) {
        let stale: Vec<u32> = match self.relocations() {
            Some(table) => table
                .iter()
                .map(|(rva, _)| rva)
                .filter(|rva| (start..end).contains(rva))
                .collect(),
            None => return,
        };
        if stale.is_empty() {
            return;
        }
        debug!("dropping {} relocations in {start:#x}..{end:#x}", stale.len());
        if let Some(table) = self.relocations_mut() {
            for rva in stale {
                table.remove(rva);
            }
        }
    }

    /// Remove the certificate table. A signature stored at the end of the overlay is cut
    /// off with it; one followed by other overlay data is left in the file, unreferenced.
    ///
    /// Returns `true` if the image carried a certificate table.
    pub fn clear_certificates(&mut self) -> bool {
        let Some(&Directory::Certificates { file_offset, size }) =
            self.directories.get(DirectoryKind::Certificate)
        else {
            return false;
        };

        let start = self
            .overlay_origin
            .and_then(|origin| file_offset.checked_sub(origin))
            .map(|start| start as usize);
        if let Some(start) = start {
            let end = start.saturating_add(size as usize).min(self.overlay.len());
            let tail_is_padding = self.overlay[end..].iter().all(|byte| *byte == 0);
            if start <= self.overlay.len() && tail_is_padding {
                self.overlay.truncate(start);
            }
        }

        self.set_directory(DirectoryKind::Certificate, None);
        true
    }

    typed_directory!(exports, exports_mut, DirectoryKind::Export, Exports, ExportDirectory);
    typed_directory!(imports, imports_mut, DirectoryKind::Import, Imports, ImportDirectory);
    typed_directory!(
        resources,
        resources_mut,
        DirectoryKind::Resource,
        Resources,
        ResourceDirectory
    );
    typed_directory!(
        exceptions,
        exceptions_mut,
        DirectoryKind::Exception,
        Exceptions,
        ExceptionTable
    );
    typed_directory!(
        relocations,
        relocations_mut,
        DirectoryKind::BaseRelocation,
        Relocations,
        RelocationTable
    );
    typed_directory!(debug, debug_mut, DirectoryKind::Debug, Debug, DebugDirectory);
    typed_directory!(tls, tls_mut, DirectoryKind::Tls, Tls, TlsDirectory);
    typed_directory!(
        bound_imports,
        bound_imports_mut,
        DirectoryKind::BoundImport,
        BoundImports,
        BoundImportDirectory
    );
    typed_directory!(
        delay_imports,
        delay_imports_mut,
        DirectoryKind::DelayImport,
        DelayImports,
        DelayImportDirectory
    );

    /// Register a pointer-sized base relocation at `rva`, if the image is relocatable.
    /// Returns `true` if the relocation was recorded.
    pub fn add_pointer_relocation(&mut self, rva: u32) -> bool {
        if !self.is_relocatable() {
            return false;
        }
        let kind = crate::directories::relocations::RelocationType::pointer(self.is_pe32_plus());
        match self.relocations_mut() {
            Some(table) => {
                table.add(rva, kind);
                true
            }
            None => false,
        }
    }

    /// Reference to `[rva, rva + len)`, `None` if no single section holds it.
    #[must_use]
    pub fn data_ref(&self, rva: u32, len: u32) -> Option<DataRef> {
        self.store.data_ref(rva, len)
    }

    /// Read `len` bytes at `rva` from a section or the header region.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range is not mapped.
    pub fn read(&self, rva: u32, len: u32) -> Result<Vec<u8>> {
        if let Some((id, offset)) = self.store.find_section_by_rva(rva, len) {
            if let Some(section) = self.store.get(id) {
                return section.read(offset, len);
            }
        }
        let start = rva as usize;
        self.header_block
            .get(start..start + len as usize)
            .filter(|_| rva < self.store.header_size().max(1))
            .map(<[u8]>::to_vec)
            .ok_or(Error::OutOfBounds)
    }

    /// Write `bytes` at `rva` inside a final section.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no section holds the range.
    pub fn write(&mut self, rva: u32, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::OutOfBounds)?;
        let (id, offset) = self
            .store
            .find_section_by_rva(rva, len)
            .ok_or(Error::OutOfBounds)?;
        self.store
            .get_mut(id)
            .ok_or(Error::OutOfBounds)?
            .write(offset, bytes)
    }

    /// Read a little-endian value at `rva`.
    ///
    /// # Errors
    /// See [`PeImage::read`].
    pub fn read_le<T: PeIO>(&self, rva: u32) -> Result<T> {
        let len = u32::try_from(std::mem::size_of::<T>()).map_err(|_| Error::OutOfBounds)?;
        read_le(&self.read(rva, len)?)
    }

    /// Write a little-endian value at `rva`.
    ///
    /// # Errors
    /// See [`PeImage::write`].
    pub fn write_le<T: PeIO>(&mut self, rva: u32, value: T) -> Result<()> {
        let mut buffer = vec![0u8; std::mem::size_of::<T>()];
        write_le(&mut buffer, value)?;
        self.write(rva, &buffer)
    }

    /// Write a pointer-sized value at `rva`.
    ///
    /// # Errors
    /// See [`PeImage::write`].
    pub fn write_ptr(&mut self, rva: u32, value: u64) -> Result<()> {
        if self.is_pe32_plus() {
            self.write_le::<u64>(rva, value)
        } else {
            let value = u32::try_from(value).map_err(|_| Error::OutOfBounds)?;
            self.write_le::<u32>(rva, value)
        }
    }

    /// Find an open section called `name`, or add one with `characteristics`.
    pub fn open_section(&mut self, name: &str, characteristics: SectionFlags) -> SectionId {
        match self.store.find_open_by_name(name) {
            Some(id) => id,
            None => self.store.add_section(Section::new(name, characteristics)),
        }
    }

    /// Offset of the section table.
    fn section_table_offset(&self) -> u32 {
        self.pe_offset + 4 + COFF_HEADER_SIZE + u32::from(self.coff.size_of_optional_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_image_defaults() {
        let image = PeImage::new(Machine::Amd64, ImageKind::Dll);
        assert!(image.is_dll());
        assert!(image.is_pe32_plus());
        assert_eq!(image.ptr_size(), 8);
        assert_eq!(image.machine(), 0x8664);
        assert_eq!(image.entry_point(), EntryPoint::None);
        assert!(image.sections().is_empty());
        assert!(!image.is_relocatable());
        assert_eq!(image.coff().size_of_optional_header, 240);
    }

    #[test]
    fn directory_mut_marks_dirty() {
        let mut image = PeImage::new(Machine::I386, ImageKind::Executable);
        image.set_directory(
            DirectoryKind::BaseRelocation,
            Some(Directory::Relocations(RelocationTable::new())),
        );
        assert!(image.is_relocatable());
        assert!(image.directories().is_dirty(DirectoryKind::BaseRelocation));
        assert!(image.add_pointer_relocation(0x1004));
        assert_eq!(image.relocations().unwrap().len(), 1);

        image
            .coff_mut()
            .characteristics
            .insert(FileCharacteristics::RELOCS_STRIPPED);
        assert!(!image.is_relocatable());
        assert!(!image.add_pointer_relocation(0x1008));
    }

    #[test]
    fn read_and_write_by_rva() {
        let mut image = PeImage::new(Machine::I386, ImageKind::Executable);
        image
            .sections_mut()
            .place_section(Section::with_address(
                ".data",
                SectionFlags::DATA,
                0x1000,
                0x100,
                vec![0; 0x80],
            ))
            .unwrap();

        image.write(0x1010, &[1, 2, 3, 4]).unwrap();
        assert_eq!(image.read(0x1010, 4).unwrap(), vec![1, 2, 3, 4]);
        // zero-filled tail
        assert_eq!(image.read(0x10F0, 4).unwrap(), vec![0; 4]);
        assert!(image.read(0x1100, 4).is_err());
        assert_eq!(image.read(0, 2).unwrap(), b"MZ".to_vec());
    }

    #[test]
    fn clear_certificates_cuts_trailing_signature() {
        let mut image = PeImage::new(Machine::I386, ImageKind::Executable);
        assert!(!image.clear_certificates());

        let mut overlay = vec![0xAA; 0x10];
        overlay.extend_from_slice(&[0x55; 0x20]);
        image.set_overlay(overlay);
        image.overlay_origin = Some(0x1000);
        image.set_directory(
            DirectoryKind::Certificate,
            Some(Directory::Certificates {
                file_offset: 0x1010,
                size: 0x20,
            }),
        );

        assert!(image.clear_certificates());
        assert_eq!(image.overlay(), &[0xAA; 0x10]);
        assert!(image.directory(DirectoryKind::Certificate).is_none());
    }

    #[test]
    fn moved_directory_drops_stale_relocations() {
        let mut guest = crate::test::factories::guest_dll_x86();
        let before = guest.relocations().unwrap().len();
        let (old_rva, old_size) = guest
            .directories()
            .table_entry(DirectoryKind::Tls, guest.sections());
        let old = old_rva..old_rva + old_size;
        assert!(guest
            .relocations()
            .unwrap()
            .iter()
            .any(|(rva, _)| old.contains(&rva)));

        guest.tls_mut().unwrap();
        let written = crate::test::factories::reparse(&mut guest);
        let (new_rva, new_size) = written
            .directories()
            .table_entry(DirectoryKind::Tls, written.sections());
        let new = new_rva..new_rva + new_size;

        let relocations = written.relocations().unwrap();
        assert_eq!(relocations.len(), before);
        assert!(relocations
            .iter()
            .filter(|(rva, _)| old.contains(rva))
            .all(|(rva, _)| new.contains(&rva)));
        assert!(relocations.iter().any(|(rva, _)| new.contains(&rva)));
    }
}
