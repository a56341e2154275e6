//! Typed data directories.
//!
//! Each of the 16 slots of the optional header's data directory table is modelled by a
//! [`DirectorySlot`] holding an optional [`Directory`] and the location its bytes currently
//! occupy. A directory read from a file is *clean*: it knows where its bytes are and the
//! writer leaves them alone. Mutable access through [`crate::PeImage`] drops the location,
//! making the slot *dirty*; at serialization time every dirty directory is re-encoded into
//! fresh space, in the fixed order of [`DirectoryKind::COMMIT_ORDER`].
//!
//! Directories never hold raw RVAs. Parsers turn every RVA into a
//! [`crate::image::DataRef`] through a [`ParseContext`], and encoders turn them back
//! through an [`EncodeContext`], which is what keeps directories valid while sections are
//! added, placed or transplanted between images.
//!
//! # Key Components
//!
//! - [`DirectoryKind`] - the 16 slot indices
//! - [`Directory`] - closed union of every supported directory
//! - [`ParseContext`] / [`EncodeContext`] - RVA ⇄ reference translation
//! - [`Encoded`] - encoder output: bytes, absolute pointer fields and out-of-line patches

pub mod bound;
pub mod debug;
pub mod delay;
pub mod exceptions;
pub mod exports;
pub mod imports;
pub mod relocations;
pub mod resources;
pub mod tls;

use std::borrow::Cow;

use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::{
    image::{Allocation, DataRef, SectionStore},
    Result,
};

use self::{
    bound::BoundImportDirectory, debug::DebugDirectory, delay::DelayImportDirectory,
    exceptions::ExceptionTable, exports::ExportDirectory, imports::ImportDirectory,
    relocations::RelocationTable, resources::ResourceDirectory, tls::TlsDirectory,
};

/// Index of a data directory slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount, Display, FromRepr,
)]
#[repr(u8)]
pub enum DirectoryKind {
    /// Export table
    Export = 0,
    /// Import table
    Import = 1,
    /// Resource tree
    Resource = 2,
    /// Exception (runtime function) table
    Exception = 3,
    /// Attribute certificates, addressed by file offset
    Certificate = 4,
    /// Base relocation table
    BaseRelocation = 5,
    /// Debug directory
    Debug = 6,
    /// Reserved, must be zero
    Architecture = 7,
    /// Global pointer register value
    GlobalPtr = 8,
    /// Thread local storage
    Tls = 9,
    /// Load configuration
    LoadConfig = 10,
    /// Bound imports
    BoundImport = 11,
    /// Import address table
    Iat = 12,
    /// Delay-load imports
    DelayImport = 13,
    /// CLR runtime header
    ClrRuntime = 14,
    /// Reserved, must be zero
    Reserved = 15,
}

impl DirectoryKind {
    /// Order in which dirty directories are laid out and encoded.
    pub const COMMIT_ORDER: [DirectoryKind; 8] = [
        DirectoryKind::Import,
        DirectoryKind::Export,
        DirectoryKind::Resource,
        DirectoryKind::DelayImport,
        DirectoryKind::Tls,
        DirectoryKind::Debug,
        DirectoryKind::BoundImport,
        DirectoryKind::Exception,
    ];

    /// Slot index in the data directory table.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Location of a directory this crate does not interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawData {
    /// Inside a section
    Mapped(DataRef),
    /// Outside every section, e.g. in the headers
    Unmapped(u32),
}

/// A parsed data directory.
#[derive(Debug, Clone, PartialEq)]
pub enum Directory {
    /// Export table
    Exports(ExportDirectory),
    /// Import table
    Imports(ImportDirectory),
    /// Resource tree
    Resources(ResourceDirectory),
    /// Runtime function table
    Exceptions(ExceptionTable),
    /// Authenticode signature blob in the overlay
    Certificates {
        /// File offset of the blob
        file_offset: u32,
        /// Size of the blob
        size: u32,
    },
    /// Base relocations
    Relocations(RelocationTable),
    /// Debug entries
    Debug(DebugDirectory),
    /// Thread local storage
    Tls(TlsDirectory),
    /// Bound imports
    BoundImports(BoundImportDirectory),
    /// Delay-load imports
    DelayImports(DelayImportDirectory),
    /// Any other directory, kept as an opaque range
    Raw {
        /// Where the range lives
        data: RawData,
        /// Size of the range
        size: u32,
    },
}

impl Directory {
    /// Encode this directory at `ctx.base_rva()`. Returns `None` for directories that are
    /// never re-encoded (certificates and raw ranges).
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if a reference can not be resolved.
    pub fn encode(&self, ctx: &EncodeContext) -> Result<Option<Encoded>> {
        let encoded = match self {
            Directory::Exports(directory) => directory.encode(ctx)?,
            Directory::Imports(directory) => directory.encode(ctx)?,
            Directory::Resources(directory) => directory.encode(ctx)?,
            Directory::Exceptions(directory) => directory.encode(ctx)?,
            Directory::Relocations(directory) => directory.encode(ctx)?,
            Directory::Debug(directory) => directory.encode(ctx)?,
            Directory::Tls(directory) => directory.encode(ctx)?,
            Directory::BoundImports(directory) => directory.encode(ctx)?,
            Directory::DelayImports(directory) => directory.encode(ctx)?,
            Directory::Certificates { .. } | Directory::Raw { .. } => return Ok(None),
        };
        Ok(Some(encoded))
    }

    /// Alignment the encoded bytes need.
    #[must_use]
    pub fn alignment(&self, pe32_plus: bool) -> u32 {
        match self {
            Directory::Imports(_) | Directory::Tls(_) | Directory::DelayImports(_)
                if pe32_plus =>
            {
                8
            }
            _ => 4,
        }
    }

    /// Short name used in log messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Directory::Exports(_) => "exports",
            Directory::Imports(_) => "imports",
            Directory::Resources(_) => "resources",
            Directory::Exceptions(_) => "exceptions",
            Directory::Certificates { .. } => "certificates",
            Directory::Relocations(_) => "relocations",
            Directory::Debug(_) => "debug",
            Directory::Tls(_) => "tls",
            Directory::BoundImports(_) => "bound imports",
            Directory::DelayImports(_) => "delay imports",
            Directory::Raw { .. } => "raw",
        }
    }
}

/// Where the bytes of a clean directory live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryLocation {
    /// Inside a section; claimed if this crate allocated it
    Section(Allocation),
    /// Outside every section (header region), or empty
    Unmapped {
        /// RVA written to the table
        rva: u32,
        /// Size written to the table
        size: u32,
    },
}

/// One entry of the data directory table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectorySlot {
    directory: Option<Directory>,
    location: Option<DirectoryLocation>,
}

impl DirectorySlot {
    /// The directory in this slot.
    #[must_use]
    pub fn directory(&self) -> Option<&Directory> {
        self.directory.as_ref()
    }

    /// Current location, `None` if dirty or empty.
    #[must_use]
    pub fn location(&self) -> Option<&DirectoryLocation> {
        self.location.as_ref()
    }

    /// Returns `true` if the directory must be re-encoded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.directory
            .as_ref()
            .is_some_and(|directory| directory.encode_needed())
            && self.location.is_none()
    }
}

impl Directory {
    fn encode_needed(&self) -> bool {
        !matches!(self, Directory::Certificates { .. } | Directory::Raw { .. })
    }
}

/// The 16 data directory slots of an image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataDirectories {
    slots: [DirectorySlot; 16],
}

impl DataDirectories {
    /// Slot of `kind`.
    #[must_use]
    pub fn slot(&self, kind: DirectoryKind) -> &DirectorySlot {
        &self.slots[kind.index()]
    }

    /// Directory of `kind`, if present.
    #[must_use]
    pub fn get(&self, kind: DirectoryKind) -> Option<&Directory> {
        self.slots[kind.index()].directory.as_ref()
    }

    /// Mutable directory access. Marks the slot dirty and returns the location it held so
    /// the caller can release it.
    pub(crate) fn get_mut(
        &mut self,
        kind: DirectoryKind,
    ) -> (Option<&mut Directory>, Option<DirectoryLocation>) {
        let slot = &mut self.slots[kind.index()];
        let released = if slot
            .directory
            .as_ref()
            .is_some_and(Directory::encode_needed)
        {
            slot.location.take()
        } else {
            None
        };
        (slot.directory.as_mut(), released)
    }

    /// Replace the directory of `kind`; the new one is dirty. Returns the old location.
    pub(crate) fn set(
        &mut self,
        kind: DirectoryKind,
        directory: Option<Directory>,
    ) -> Option<DirectoryLocation> {
        let slot = &mut self.slots[kind.index()];
        slot.directory = directory;
        slot.location.take()
    }

    /// Install a parsed directory together with the location it was read from.
    pub(crate) fn set_clean(
        &mut self,
        kind: DirectoryKind,
        directory: Directory,
        location: DirectoryLocation,
    ) {
        let slot = &mut self.slots[kind.index()];
        slot.directory = Some(directory);
        slot.location = Some(location);
    }

    pub(crate) fn set_location(&mut self, kind: DirectoryKind, location: DirectoryLocation) {
        self.slots[kind.index()].location = Some(location);
    }

    /// Returns `true` if the slot must be re-encoded.
    #[must_use]
    pub fn is_dirty(&self, kind: DirectoryKind) -> bool {
        self.slots[kind.index()].is_dirty()
    }

    /// `(rva, size)` to write into the table for `kind`. Certificates report their file
    /// offset, which the writer adjusts for a moved overlay.
    #[must_use]
    pub fn table_entry(&self, kind: DirectoryKind, store: &SectionStore) -> (u32, u32) {
        let slot = &self.slots[kind.index()];
        match (&slot.directory, &slot.location) {
            (None, _) => (0, 0),
            (Some(Directory::Certificates { file_offset, size }), _) => (*file_offset, *size),
            (Some(Directory::Raw { data, size }), _) => match data {
                RawData::Mapped(data) => (data.rva(store), *size),
                RawData::Unmapped(rva) => (*rva, *size),
            },
            (Some(_), Some(DirectoryLocation::Section(allocation))) => {
                let data = allocation.data();
                (data.rva(store), data.size().unwrap_or(0))
            }
            (Some(_), Some(DirectoryLocation::Unmapped { rva, size })) => (*rva, *size),
            (Some(_), None) => (0, 0),
        }
    }
}

/// Translation of RVAs into references while parsing.
pub struct ParseContext<'a> {
    store: &'a SectionStore,
    header: &'a [u8],
    image_base: u64,
    pe32_plus: bool,
    machine: u16,
}

impl<'a> ParseContext<'a> {
    /// A context over `store`, with `header` holding the bytes below the first section.
    #[must_use]
    pub fn new(
        store: &'a SectionStore,
        header: &'a [u8],
        image_base: u64,
        pe32_plus: bool,
        machine: u16,
    ) -> Self {
        ParseContext {
            store,
            header,
            image_base,
            pe32_plus,
            machine,
        }
    }

    /// The sections being parsed.
    #[must_use]
    pub fn store(&self) -> &'a SectionStore {
        self.store
    }

    /// Preferred image base.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// `true` for PE32+.
    #[must_use]
    pub fn pe32_plus(&self) -> bool {
        self.pe32_plus
    }

    /// `IMAGE_FILE_MACHINE_*` of the image.
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Pointer size of the image.
    #[must_use]
    pub fn ptr_size(&self) -> u32 {
        if self.pe32_plus {
            8
        } else {
            4
        }
    }

    /// Reference `[rva, rva + len)`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section holds the whole range.
    pub fn data_ref(&self, rva: u32, len: u32) -> Result<DataRef> {
        self.store.data_ref(rva, len.max(1)).map(|data| data.with_size(len)).ok_or_else(|| {
            malformed_error!(
                "RVA range {:#x}+{:#x} is not inside a section",
                rva,
                len
            )
        })
    }

    /// Like [`ParseContext::data_ref`], but RVA `0` yields a null reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a non-zero RVA can not be resolved.
    pub fn data_ref_or_null(&self, rva: u32, len: u32) -> Result<DataRef> {
        if rva == 0 {
            Ok(DataRef::null())
        } else {
            self.data_ref(rva, len)
        }
    }

    /// Convert an absolute address to an RVA.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for addresses below the image base or beyond
    /// the 32-bit RVA space.
    pub fn va_to_rva(&self, va: u64) -> Result<u32> {
        va.checked_sub(self.image_base)
            .and_then(|rva| u32::try_from(rva).ok())
            .ok_or_else(|| {
                malformed_error!(
                    "Address {:#x} is outside the image at {:#x}",
                    va,
                    self.image_base
                )
            })
    }

    /// Bytes from `rva` to the end of the section (or header region) holding it. Bytes in
    /// the zero-filled tail of a section are materialized.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `rva` is not mapped.
    pub fn view(&self, rva: u32) -> Result<Cow<'a, [u8]>> {
        if let Some((id, offset)) = self.store.find_section_by_rva(rva, 1) {
            let section = self
                .store
                .get(id)
                .ok_or_else(|| malformed_error!("RVA {:#x} has no section", rva))?;
            let data = section.data();
            let mapped = section.mapped_size() as usize;
            let offset = offset as usize;

            if mapped <= data.len() {
                return Ok(Cow::Borrowed(&data[offset.min(data.len())..mapped]));
            }
            let mut owned = data.get(offset..).map(<[u8]>::to_vec).unwrap_or_default();
            owned.resize(mapped - offset, 0);
            return Ok(Cow::Owned(owned));
        }

        if (rva as usize) < self.header.len() {
            return Ok(Cow::Borrowed(&self.header[rva as usize..]));
        }
        Err(malformed_error!("RVA {:#x} is not mapped", rva))
    }

    /// Copy `len` bytes at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the range is not mapped.
    pub fn read(&self, rva: u32, len: u32) -> Result<Vec<u8>> {
        let view = self.view(rva)?;
        view.get(..len as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| malformed_error!("Range {:#x}+{:#x} exceeds its section", rva, len))
    }

    /// Read a NUL-terminated string at `rva`. Invalid UTF-8 is replaced.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `rva` is not mapped.
    pub fn read_cstring(&self, rva: u32) -> Result<String> {
        let view = self.view(rva)?;
        let len = view.iter().position(|b| *b == 0).unwrap_or(view.len());
        Ok(String::from_utf8_lossy(&view[..len]).into_owned())
    }
}

/// Translation of references into RVAs and addresses while encoding.
///
/// A sizing context, used to measure a directory before space is allocated for it,
/// resolves every reference to zero.
pub struct EncodeContext<'a> {
    store: Option<&'a SectionStore>,
    image_base: u64,
    pe32_plus: bool,
    base_rva: u32,
}

impl<'a> EncodeContext<'a> {
    /// Context for encoding at `base_rva`.
    #[must_use]
    pub fn new(store: &'a SectionStore, image_base: u64, pe32_plus: bool, base_rva: u32) -> Self {
        EncodeContext {
            store: Some(store),
            image_base,
            pe32_plus,
            base_rva,
        }
    }

    /// Context for measuring the encoded size.
    #[must_use]
    pub fn sizing(image_base: u64, pe32_plus: bool) -> Self {
        EncodeContext {
            store: None,
            image_base,
            pe32_plus,
            base_rva: 0,
        }
    }

    /// RVA the encoded bytes will be placed at.
    #[must_use]
    pub fn base_rva(&self) -> u32 {
        self.base_rva
    }

    /// Preferred image base.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// `true` for PE32+.
    #[must_use]
    pub fn pe32_plus(&self) -> bool {
        self.pe32_plus
    }

    /// Pointer size of the image.
    #[must_use]
    pub fn ptr_size(&self) -> u32 {
        if self.pe32_plus {
            8
        } else {
            4
        }
    }

    /// RVA of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] for null references and references into removed
    /// or unplaced sections.
    pub fn rva_of(&self, data: &DataRef) -> Result<u32> {
        let Some(store) = self.store else {
            return Ok(0);
        };
        if data.is_null() {
            return Err(internal_error!("null reference during encoding"));
        }
        data.try_rva(store).ok_or_else(|| {
            internal_error!(
                "reference into section {:?} has no final address",
                data.section_id()
            )
        })
    }

    /// RVA of `data`, `0` for null references.
    ///
    /// # Errors
    /// See [`EncodeContext::rva_of`].
    pub fn rva_or_zero(&self, data: &DataRef) -> Result<u32> {
        if data.is_null() {
            Ok(0)
        } else {
            self.rva_of(data)
        }
    }

    /// Absolute address of `data`, `0` for null references.
    ///
    /// # Errors
    /// See [`EncodeContext::rva_of`].
    pub fn va_or_zero(&self, data: &DataRef) -> Result<u64> {
        if data.is_null() {
            Ok(0)
        } else {
            Ok(self.image_base + u64::from(self.rva_of(data)?))
        }
    }

    /// Append a pointer-sized value to `bytes`.
    pub fn push_ptr(&self, bytes: &mut Vec<u8>, value: u64) {
        if self.pe32_plus {
            bytes.extend_from_slice(&value.to_le_bytes());
        } else {
            #[allow(clippy::cast_possible_truncation)]
            bytes.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }
}

/// Bytes written somewhere other than the directory's own allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Where to write
    pub target: DataRef,
    /// What to write
    pub bytes: Vec<u8>,
}

/// Output of a directory encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoded {
    /// Directory bytes, to be placed at the base RVA
    pub bytes: Vec<u8>,
    /// Offsets into `bytes` holding absolute pointers that need base relocations
    pub absolute_fields: Vec<u32>,
    /// Writes into other sections, e.g. IAT slots
    pub patches: Vec<Patch>,
}

impl Encoded {
    /// Encoder output consisting of `bytes` only.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Encoded {
            bytes,
            ..Encoded::default()
        }
    }

    /// Size of the encoded bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }
}

/// Offset of the next byte appended to `bytes`, as `u32`.
pub(crate) fn cursor(bytes: &[u8]) -> u32 {
    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}

/// Pad `bytes` with zeros to a multiple of `alignment`.
pub(crate) fn pad_to(bytes: &mut Vec<u8>, alignment: usize) {
    while bytes.len() % alignment != 0 {
        bytes.push(0);
    }
}

/// Overwrite a little-endian `u32` at `offset`.
pub(crate) fn put_u32(bytes: &mut [u8], offset: u32, value: u32) {
    let offset = offset as usize;
    if let Some(slot) = bytes.get_mut(offset..offset + 4) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Section, SectionFlags};
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn kinds() {
        assert_eq!(DirectoryKind::COUNT, 16);
        assert_eq!(DirectoryKind::Tls.index(), 9);
        assert_eq!(DirectoryKind::from_repr(13), Some(DirectoryKind::DelayImport));
        assert_eq!(DirectoryKind::iter().last(), Some(DirectoryKind::Reserved));
    }

    #[test]
    fn dirty_tracking() {
        let mut directories = DataDirectories::default();
        let store = SectionStore::new(0x1000, 0x400);

        directories.set_clean(
            DirectoryKind::BaseRelocation,
            Directory::Relocations(RelocationTable::new()),
            DirectoryLocation::Unmapped {
                rva: 0x5000,
                size: 0x10,
            },
        );
        assert!(!directories.is_dirty(DirectoryKind::BaseRelocation));
        assert_eq!(
            directories.table_entry(DirectoryKind::BaseRelocation, &store),
            (0x5000, 0x10)
        );

        let (directory, released) = directories.get_mut(DirectoryKind::BaseRelocation);
        assert!(directory.is_some());
        assert!(released.is_some());
        assert!(directories.is_dirty(DirectoryKind::BaseRelocation));

        directories.set(
            DirectoryKind::Certificate,
            Some(Directory::Certificates {
                file_offset: 0x800,
                size: 0x100,
            }),
        );
        assert!(!directories.is_dirty(DirectoryKind::Certificate));
        assert_eq!(
            directories.table_entry(DirectoryKind::Certificate, &store),
            (0x800, 0x100)
        );
        assert_eq!(directories.table_entry(DirectoryKind::Export, &store), (0, 0));
    }

    #[test]
    fn parse_context_views() {
        let mut store = SectionStore::new(0x1000, 0x400);
        store
            .place_section(Section::with_address(
                ".rdata",
                SectionFlags::RDATA,
                0x2000,
                0x20,
                b"KERNEL32.dll\0".to_vec(),
            ))
            .unwrap();
        let header = vec![0xAAu8; 0x400];
        let ctx = ParseContext::new(&store, &header, 0x40_0000, false, 0x14c);

        assert_eq!(ctx.read_cstring(0x2000).unwrap(), "KERNEL32.dll");
        assert_eq!(ctx.view(0x2010).unwrap().as_ref(), &[0u8; 0x10][..]);
        assert_eq!(ctx.read(0x3F0, 4).unwrap(), vec![0xAA; 4]);
        assert!(ctx.read(0x2018, 0x10).is_err());
        assert!(ctx.data_ref(0x2000, 0x21).is_err());
        assert_eq!(ctx.va_to_rva(0x40_2000).unwrap(), 0x2000);
        assert!(ctx.va_to_rva(0x1000).is_err());
        assert!(ctx.data_ref_or_null(0, 4).unwrap().is_null());
    }

    #[test]
    fn encode_context_rejects_unplaced() {
        let mut store = SectionStore::new(0x1000, 0x400);
        let open = store.add_section(Section::new(".pedata", SectionFlags::RDATA));
        let ctx = EncodeContext::new(&store, 0x40_0000, false, 0x5000);

        assert!(matches!(
            ctx.rva_of(&DataRef::new(open, 0)),
            Err(crate::Error::Internal { .. })
        ));
        assert!(ctx.rva_of(&DataRef::null()).is_err());
        assert_eq!(ctx.va_or_zero(&DataRef::null()).unwrap(), 0);

        let sizing = EncodeContext::sizing(0x40_0000, false);
        assert_eq!(sizing.rva_of(&DataRef::new(open, 0)).unwrap(), 0);
    }
}
