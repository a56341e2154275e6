//! A single PE section: name, flags, bytes and its layout phase.
//!
//! A section starts out either *open* or *final*:
//!
//! - **Open** sections have no address yet. They own an [`AddressSpaceAllocator`] over their
//!   own offsets so directories can be laid out inside them incrementally. Their virtual
//!   size is simply the length of their buffer.
//! - **Final** sections have a fixed virtual address and virtual size. Every section read
//!   from a file is final, and open sections become final when the image is serialized.
//!
//! Data is always addressed section-relative, which is what lets a section be placed or
//! moved without touching any reference into it.

use bitflags::bitflags;
use goblin::pe::section_table::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA,
    IMAGE_SCN_MEM_DISCARDABLE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_NOT_CACHED,
    IMAGE_SCN_MEM_NOT_PAGED, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_SHARED, IMAGE_SCN_MEM_WRITE,
};

use crate::{
    file::io::{read_le, write_le, PeIO},
    image::allocator::AddressSpaceAllocator,
    Result,
};

/// Size of one entry of the section table.
pub const SECTION_HEADER_SIZE: u32 = 40;

bitflags! {
    /// `IMAGE_SCN_*` characteristics of a section. Unknown bits are preserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code
        const CNT_CODE = IMAGE_SCN_CNT_CODE;
        /// The section contains initialized data
        const CNT_INITIALIZED_DATA = IMAGE_SCN_CNT_INITIALIZED_DATA;
        /// The section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = IMAGE_SCN_CNT_UNINITIALIZED_DATA;
        /// The section can be discarded after loading
        const MEM_DISCARDABLE = IMAGE_SCN_MEM_DISCARDABLE;
        /// The section can not be cached
        const MEM_NOT_CACHED = IMAGE_SCN_MEM_NOT_CACHED;
        /// The section is not pageable
        const MEM_NOT_PAGED = IMAGE_SCN_MEM_NOT_PAGED;
        /// The section can be shared in memory
        const MEM_SHARED = IMAGE_SCN_MEM_SHARED;
        /// The section can be executed
        const MEM_EXECUTE = IMAGE_SCN_MEM_EXECUTE;
        /// The section can be read
        const MEM_READ = IMAGE_SCN_MEM_READ;
        /// The section can be written
        const MEM_WRITE = IMAGE_SCN_MEM_WRITE;

        const _ = !0;
    }
}

impl SectionFlags {
    /// Flags of a typical code section (`.text`).
    pub const CODE: SectionFlags = SectionFlags::CNT_CODE
        .union(SectionFlags::MEM_EXECUTE)
        .union(SectionFlags::MEM_READ);

    /// Flags of a typical read-only data section (`.rdata`).
    pub const RDATA: SectionFlags =
        SectionFlags::CNT_INITIALIZED_DATA.union(SectionFlags::MEM_READ);

    /// Flags of a typical writable data section (`.data`).
    pub const DATA: SectionFlags = SectionFlags::CNT_INITIALIZED_DATA
        .union(SectionFlags::MEM_READ)
        .union(SectionFlags::MEM_WRITE);
}

/// Header fields that only matter for byte-exact re-serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSectionInfo {
    /// File offset of the section data as read
    pub pointer_to_raw_data: u32,
    /// `SizeOfRawData` as read
    pub size_of_raw_data: u32,
    /// COFF relocations pointer (objects only, preserved verbatim)
    pub pointer_to_relocations: u32,
    /// COFF line numbers pointer (deprecated, preserved verbatim)
    pub pointer_to_linenumbers: u32,
    /// COFF relocation count (preserved verbatim)
    pub number_of_relocations: u16,
    /// COFF line number count (preserved verbatim)
    pub number_of_linenumbers: u16,
}

/// Layout phase of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionPhase {
    /// Not placed yet; space inside the section is handed out by the allocator.
    Open(AddressSpaceAllocator),
    /// Placed at a fixed address.
    Final {
        /// RVA of the first byte
        virtual_address: u32,
        /// Size of the section once mapped
        virtual_size: u32,
    },
}

/// A section of a PE image.
#[derive(Debug, Clone)]
pub struct Section {
    name: [u8; 8],
    characteristics: SectionFlags,
    data: Vec<u8>,
    phase: SectionPhase,
    raw: RawSectionInfo,
}

impl Section {
    /// Create an open section. Names longer than 8 bytes are truncated.
    #[must_use]
    pub fn new(name: &str, characteristics: SectionFlags) -> Self {
        Section {
            name: encode_name(name),
            characteristics,
            data: Vec::new(),
            phase: SectionPhase::Open(AddressSpaceAllocator::new()),
            raw: RawSectionInfo::default(),
        }
    }

    /// Create a final section with the given address, virtual size and contents.
    #[must_use]
    pub fn with_address(
        name: &str,
        characteristics: SectionFlags,
        virtual_address: u32,
        virtual_size: u32,
        data: Vec<u8>,
    ) -> Self {
        Section {
            name: encode_name(name),
            characteristics,
            data,
            phase: SectionPhase::Final {
                virtual_address,
                virtual_size,
            },
            raw: RawSectionInfo::default(),
        }
    }

    pub(crate) fn from_header(
        name: [u8; 8],
        characteristics: u32,
        virtual_address: u32,
        virtual_size: u32,
        data: Vec<u8>,
        raw: RawSectionInfo,
    ) -> Self {
        Section {
            name,
            characteristics: SectionFlags::from_bits_retain(characteristics),
            data,
            phase: SectionPhase::Final {
                virtual_address,
                virtual_size,
            },
            raw,
        }
    }

    /// Section name with trailing NULs removed.
    #[must_use]
    pub fn name(&self) -> String {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Raw 8-byte name as stored in the section table.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8; 8] {
        &self.name
    }

    /// Rename the section.
    pub fn set_name(&mut self, name: &str) {
        self.name = encode_name(name);
    }

    /// Section characteristics.
    #[must_use]
    pub fn characteristics(&self) -> SectionFlags {
        self.characteristics
    }

    /// Replace the section characteristics.
    pub fn set_characteristics(&mut self, characteristics: SectionFlags) {
        self.characteristics = characteristics;
    }

    /// Add characteristics, e.g. [`SectionFlags::MEM_WRITE`] for a section holding an IAT.
    pub fn add_characteristics(&mut self, characteristics: SectionFlags) {
        self.characteristics |= characteristics;
    }

    /// Section bytes as stored in the file (may be shorter than the virtual size).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the section bytes.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Current layout phase.
    #[must_use]
    pub fn phase(&self) -> &SectionPhase {
        &self.phase
    }

    /// Returns `true` if the section has no address yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.phase, SectionPhase::Open(_))
    }

    /// RVA of the section, `None` while open.
    #[must_use]
    pub fn virtual_address(&self) -> Option<u32> {
        match self.phase {
            SectionPhase::Open(_) => None,
            SectionPhase::Final {
                virtual_address, ..
            } => Some(virtual_address),
        }
    }

    /// Declared virtual size; for open sections the buffer length.
    #[must_use]
    pub fn virtual_size(&self) -> u32 {
        match self.phase {
            SectionPhase::Open(_) => u32::try_from(self.data.len()).unwrap_or(u32::MAX),
            SectionPhase::Final { virtual_size, .. } => virtual_size,
        }
    }

    /// Number of bytes the loader maps for this section.
    ///
    /// A zero virtual size means the raw size is used, as the Windows loader does.
    #[must_use]
    pub fn mapped_size(&self) -> u32 {
        let data_len = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        match self.phase {
            SectionPhase::Open(_) => data_len,
            SectionPhase::Final { virtual_size, .. } if virtual_size == 0 => data_len,
            SectionPhase::Final { virtual_size, .. } => virtual_size,
        }
    }

    pub(crate) fn set_virtual_size(&mut self, size: u32) {
        if let SectionPhase::Final { virtual_size, .. } = &mut self.phase {
            *virtual_size = size;
        }
    }

    /// Returns `true` if `[rva, rva + len)` lies entirely inside this final section.
    #[must_use]
    pub fn contains_range(&self, rva: u32, len: u32) -> bool {
        let Some(start) = self.virtual_address() else {
            return false;
        };
        let end = u64::from(start) + u64::from(self.mapped_size());
        rva >= start && u64::from(rva) + u64::from(len.max(1)) <= end
    }

    /// Header fields preserved from the file.
    #[must_use]
    pub fn raw_info(&self) -> &RawSectionInfo {
        &self.raw
    }

    pub(crate) fn raw_info_mut(&mut self) -> &mut RawSectionInfo {
        &mut self.raw
    }

    /// Reserve `size` bytes at an offset aligned to `alignment` inside an open section.
    ///
    /// The buffer grows as needed; new bytes are zero.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if the section is already final, and
    /// [`crate::Error::NoAddressSpace`] if the section would exceed its limit.
    pub fn allocate(&mut self, size: u32, alignment: u32) -> Result<u32> {
        let SectionPhase::Open(allocator) = &mut self.phase else {
            return Err(internal_error!(
                "allocation of {:#x} bytes in final section {}",
                size,
                String::from_utf8_lossy(&self.name)
            ));
        };

        let offset = allocator
            .find_space(size, alignment)
            .ok_or(crate::Error::NoAddressSpace { size })?;
        allocator.claim(offset, size)?;

        let end = offset as usize + size as usize;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        Ok(offset)
    }

    /// Give back a range obtained from [`Section::allocate`]; a no-op for final sections.
    pub(crate) fn release(&mut self, offset: u32, size: u32) {
        if let SectionPhase::Open(allocator) = &mut self.phase {
            allocator.release(offset, size);
        }
    }

    /// Transition an open section to final at `virtual_address`.
    pub(crate) fn finalize(&mut self, virtual_address: u32) {
        let virtual_size = self.virtual_size();
        self.finalize_at(virtual_address, virtual_size);
    }

    pub(crate) fn finalize_at(&mut self, virtual_address: u32, virtual_size: u32) {
        self.phase = SectionPhase::Final {
            virtual_address,
            virtual_size,
        };
    }

    /// Read `len` bytes at `offset`; bytes in the mapped but not stored tail read as zero.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the mapped section.
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let end = u64::from(offset) + u64::from(len);
        let limit = u64::from(self.mapped_size()).max(self.data.len() as u64);
        if end > limit {
            return Err(crate::Error::OutOfBounds);
        }

        let start = offset as usize;
        let end = end as usize;
        let mut out = vec![0u8; end - start];
        if start < self.data.len() {
            let stored = end.min(self.data.len());
            out[..stored - start].copy_from_slice(&self.data[start..stored]);
        }
        Ok(out)
    }

    /// Read a little-endian value at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value leaves the mapped section.
    pub fn read_le<T: PeIO>(&self, offset: u32) -> Result<T> {
        let len = u32::try_from(std::mem::size_of::<T>()).unwrap_or(u32::MAX);
        read_le(&self.read(offset, len)?)
    }

    /// Write `bytes` at `offset`, growing the stored buffer if the range lies in the
    /// zero-filled tail. Open sections grow without limit.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if a final section would have to grow past
    /// its mapped size.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let end = offset as usize + bytes.len();
        if !self.is_open() && end > (self.mapped_size() as usize).max(self.data.len()) {
            return Err(crate::Error::OutOfBounds);
        }

        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Write a little-endian value at `offset`.
    ///
    /// # Errors
    /// See [`Section::write`].
    pub fn write_le<T: PeIO>(&mut self, offset: u32, value: T) -> Result<()> {
        let mut buffer = vec![0u8; std::mem::size_of::<T>()];
        write_le(&mut buffer, value)?;
        self.write(offset, &buffer)
    }

    /// Size of the raw data written for this section, before file alignment.
    pub(crate) fn stored_len(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }
}

fn encode_name(name: &str) -> [u8; 8] {
    let mut encoded = [0u8; 8];
    let bytes = name.as_bytes();
    let len = bytes.len().min(8);
    encoded[..len].copy_from_slice(&bytes[..len]);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let mut section = Section::new(".text", SectionFlags::CODE);
        assert_eq!(section.name(), ".text");
        assert_eq!(section.name_bytes(), b".text\0\0\0");

        section.set_name(".verylongname");
        assert_eq!(section.name(), ".verylon");
    }

    #[test]
    fn open_allocation() {
        let mut section = Section::new(".pedata", SectionFlags::RDATA);
        let a = section.allocate(0x14, 4).unwrap();
        let b = section.allocate(0x10, 8).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 0x18);
        assert_eq!(section.data().len(), 0x28);
        assert_eq!(section.virtual_size(), 0x28);

        section.release(a, 0x14);
        assert_eq!(section.allocate(0x8, 4).unwrap(), 0);
    }

    #[test]
    fn final_rejects_allocation() {
        let mut section =
            Section::with_address(".text", SectionFlags::CODE, 0x1000, 0x200, vec![0xC3]);
        assert!(matches!(
            section.allocate(4, 4),
            Err(crate::Error::Internal { .. })
        ));
    }

    #[test]
    fn finalize() {
        let mut section = Section::new(".meta", SectionFlags::DATA);
        section.allocate(0x30, 4).unwrap();
        section.finalize(0x5000);
        assert!(!section.is_open());
        assert_eq!(section.virtual_address(), Some(0x5000));
        assert_eq!(section.virtual_size(), 0x30);
        assert!(section.contains_range(0x5000, 0x30));
        assert!(!section.contains_range(0x5000, 0x31));
        assert!(!section.contains_range(0x4FFF, 1));
    }

    #[test]
    fn zero_tail_reads_and_writes() {
        let mut section =
            Section::with_address(".data", SectionFlags::DATA, 0x3000, 0x100, vec![1, 2, 3, 4]);
        assert_eq!(section.read(2, 4).unwrap(), vec![3, 4, 0, 0]);
        assert_eq!(section.read_le::<u32>(0x10).unwrap(), 0);
        assert!(section.read(0xFE, 4).is_err());

        section.write_le(0x20, 0xDEAD_BEEFu32).unwrap();
        assert_eq!(section.data().len(), 0x24);
        assert_eq!(section.read_le::<u32>(0x20).unwrap(), 0xDEAD_BEEF);
        assert!(section.write(0xFF, &[0, 0]).is_err());
    }

    #[test]
    fn unknown_flags_survive() {
        let section = Section::from_header(
            *b".tls\0\0\0\0",
            0xC030_0040,
            0x4000,
            0x10,
            vec![0; 0x200],
            RawSectionInfo::default(),
        );
        assert_eq!(section.characteristics().bits(), 0xC030_0040);
        assert!(section.characteristics().contains(SectionFlags::MEM_WRITE));
    }
}
