//! DOS, COFF and optional header model.
//!
//! Header fields that depend on the section layout (`SizeOfImage`, `SizeOfHeaders`,
//! `NumberOfSections`, the entry point and the data directory table) are not stored here;
//! the writer derives them from the image when serializing. Everything else is kept
//! field-for-field so an unmodified image serializes to identical bytes.

use bitflags::bitflags;
use goblin::pe::header::{
    COFF_MACHINE_ARM, COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_THUMB,
    COFF_MACHINE_X86, COFF_MACHINE_X86_64,
};
use strum::{Display, FromRepr};

use crate::{
    file::{
        io::{write_le_at, write_le_at_dyn},
        parser::Parser,
    },
    Result,
};

/// `MZ`
pub const DOS_MAGIC: u16 = 0x5A4D;
/// `PE\0\0`
pub const PE_SIGNATURE: u32 = 0x0000_4550;
/// Offset of `e_lfanew` in the DOS header.
pub const E_LFANEW_OFFSET: usize = 0x3C;
/// Size of the COFF file header.
pub const COFF_HEADER_SIZE: u32 = 20;
/// Optional header magic of PE32 images.
pub const PE32_MAGIC: u16 = 0x10b;
/// Optional header magic of PE32+ images.
pub const PE32_PLUS_MAGIC: u16 = 0x20b;
/// Number of data directory slots.
pub const DATA_DIRECTORY_COUNT: usize = 16;
/// Offset of `AddressOfEntryPoint` inside the optional header.
pub const ENTRY_POINT_OFFSET: u32 = 16;
/// Offset of `CheckSum` inside the optional header.
pub const CHECKSUM_OFFSET: u32 = 64;

/// Machines this crate knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u16)]
pub enum Machine {
    /// Intel 386 and compatibles
    #[strum(serialize = "x86")]
    I386 = COFF_MACHINE_X86,
    /// x64
    #[strum(serialize = "x64")]
    Amd64 = COFF_MACHINE_X86_64,
    /// ARM little endian
    #[strum(serialize = "arm")]
    Arm = COFF_MACHINE_ARM,
    /// ARM Thumb
    #[strum(serialize = "thumb")]
    Thumb = COFF_MACHINE_THUMB,
    /// ARM Thumb-2
    #[strum(serialize = "armnt")]
    ArmNt = COFF_MACHINE_ARMNT,
    /// ARM64
    #[strum(serialize = "arm64")]
    Arm64 = COFF_MACHINE_ARM64,
}

impl Machine {
    /// Returns `true` for machines whose images use the PE32+ format.
    #[must_use]
    pub fn is_64bit(self) -> bool {
        matches!(self, Machine::Amd64 | Machine::Arm64)
    }
}

/// Whether a new image is an executable or a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A `.exe`
    Executable,
    /// A `.dll`
    Dll,
}

bitflags! {
    /// `IMAGE_FILE_*` characteristics of the COFF header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileCharacteristics: u16 {
        /// The image has no base relocations and must load at its preferred base
        const RELOCS_STRIPPED = 0x0001;
        /// The image is valid and can be run
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers were removed
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF symbols were removed
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// The image can handle addresses above 2 GiB
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// The machine is based on a 32-bit word architecture
        const MACHINE_32BIT = 0x0100;
        /// Debugging information was removed
        const DEBUG_STRIPPED = 0x0200;
        /// The image is a system file
        const SYSTEM = 0x1000;
        /// The image is a dynamic-link library
        const DLL = 0x2000;

        const _ = !0;
    }
}

bitflags! {
    /// `IMAGE_DLLCHARACTERISTICS_*` of the optional header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DllCharacteristics: u16 {
        /// 64-bit ASLR
        const HIGH_ENTROPY_VA = 0x0020;
        /// The image can be relocated at load time
        const DYNAMIC_BASE = 0x0040;
        /// Code integrity checks are enforced
        const FORCE_INTEGRITY = 0x0080;
        /// The image is DEP compatible
        const NX_COMPAT = 0x0100;
        /// The image does not use structured exception handling
        const NO_SEH = 0x0400;
        /// The image supports control flow guard
        const GUARD_CF = 0x4000;
        /// Terminal server aware
        const TERMINAL_SERVER_AWARE = 0x8000;

        const _ = !0;
    }
}

/// Fields of the COFF file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoffHeader {
    /// `IMAGE_FILE_MACHINE_*` value
    pub machine: u16,
    /// Link time
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table
    pub pointer_to_symbol_table: u32,
    /// Number of COFF symbols
    pub number_of_symbols: u32,
    /// Size of the optional header as declared
    pub size_of_optional_header: u16,
    /// File characteristics
    pub characteristics: FileCharacteristics,
}

impl CoffHeader {
    /// Parse the COFF header; returns the header and `NumberOfSections`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the header is truncated.
    pub fn parse(parser: &mut Parser) -> Result<(Self, u16)> {
        let machine = parser.read_le::<u16>()?;
        let number_of_sections = parser.read_le::<u16>()?;
        let header = CoffHeader {
            machine,
            time_date_stamp: parser.read_le::<u32>()?,
            pointer_to_symbol_table: parser.read_le::<u32>()?,
            number_of_symbols: parser.read_le::<u32>()?,
            size_of_optional_header: parser.read_le::<u16>()?,
            characteristics: FileCharacteristics::from_bits_retain(parser.read_le::<u16>()?),
        };
        Ok((header, number_of_sections))
    }

    /// Write the header with `number_of_sections` at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
    pub fn write(&self, data: &mut [u8], offset: usize, number_of_sections: u16) -> Result<()> {
        let mut offset = offset;
        write_le_at(data, &mut offset, self.machine)?;
        write_le_at(data, &mut offset, number_of_sections)?;
        write_le_at(data, &mut offset, self.time_date_stamp)?;
        write_le_at(data, &mut offset, self.pointer_to_symbol_table)?;
        write_le_at(data, &mut offset, self.number_of_symbols)?;
        write_le_at(data, &mut offset, self.size_of_optional_header)?;
        write_le_at(data, &mut offset, self.characteristics.bits())?;
        Ok(())
    }

    /// The machine, if it is one this crate knows.
    #[must_use]
    pub fn known_machine(&self) -> Option<Machine> {
        Machine::from_repr(self.machine)
    }

    /// Returns `true` for libraries.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.characteristics.contains(FileCharacteristics::DLL)
    }
}

/// Fields of the optional header that are not derived from the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OptionalHeader {
    /// `true` for PE32+ (`0x20b`), `false` for PE32 (`0x10b`)
    pub pe32_plus: bool,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub base_of_code: u32,
    /// PE32 only
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Layout-dependent optional header fields, as read or as to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutFields {
    /// `AddressOfEntryPoint`
    pub entry_point: u32,
    /// `SizeOfImage`
    pub size_of_image: u32,
    /// `SizeOfHeaders`
    pub size_of_headers: u32,
    /// `(rva, size)` per populated data directory slot
    pub directories: Vec<(u32, u32)>,
}

impl OptionalHeader {
    /// Default header for a new image of `machine`.
    #[must_use]
    pub fn new(machine: Machine, kind: ImageKind) -> Self {
        let pe32_plus = machine.is_64bit();
        let image_base = match (kind, pe32_plus) {
            (ImageKind::Executable, false) => 0x0040_0000,
            (ImageKind::Executable, true) => 0x1_4000_0000,
            (ImageKind::Dll, false) => 0x1000_0000,
            (ImageKind::Dll, true) => 0x1_8000_0000,
        };
        let mut dll_characteristics =
            DllCharacteristics::DYNAMIC_BASE | DllCharacteristics::NX_COMPAT;
        if pe32_plus {
            dll_characteristics |= DllCharacteristics::HIGH_ENTROPY_VA;
        }

        OptionalHeader {
            pe32_plus,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            base_of_code: 0,
            base_of_data: 0,
            image_base,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            major_operating_system_version: 6,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            checksum: 0,
            subsystem: 3,
            dll_characteristics,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: DATA_DIRECTORY_COUNT as u32,
        }
    }

    /// Size of a pointer in this image format.
    #[must_use]
    pub fn ptr_size(&self) -> u32 {
        if self.pe32_plus {
            8
        } else {
            4
        }
    }

    /// Size of the optional header including a full data directory table.
    #[must_use]
    pub fn standard_size(&self) -> u16 {
        if self.pe32_plus {
            240
        } else {
            224
        }
    }

    /// Offset of the data directory table inside the optional header.
    #[must_use]
    pub fn directories_offset(&self) -> u32 {
        if self.pe32_plus {
            112
        } else {
            96
        }
    }

    /// Parse the optional header, `declared_size` bytes long.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an unknown magic and
    /// [`crate::Error::OutOfBounds`] for truncated headers.
    pub fn parse(parser: &mut Parser, declared_size: u16) -> Result<(Self, LayoutFields)> {
        let start = parser.pos();
        let magic = parser.read_le::<u16>()?;
        let pe32_plus = match magic {
            PE32_MAGIC => false,
            PE32_PLUS_MAGIC => true,
            other => return Err(malformed_error!("Invalid optional header magic {:#x}", other)),
        };

        let major_linker_version = parser.read_le::<u8>()?;
        let minor_linker_version = parser.read_le::<u8>()?;
        let size_of_code = parser.read_le::<u32>()?;
        let size_of_initialized_data = parser.read_le::<u32>()?;
        let size_of_uninitialized_data = parser.read_le::<u32>()?;
        let entry_point = parser.read_le::<u32>()?;
        let base_of_code = parser.read_le::<u32>()?;
        let (base_of_data, image_base) = if pe32_plus {
            (0, parser.read_le::<u64>()?)
        } else {
            (
                parser.read_le::<u32>()?,
                u64::from(parser.read_le::<u32>()?),
            )
        };

        let section_alignment = parser.read_le::<u32>()?;
        let file_alignment = parser.read_le::<u32>()?;
        let major_operating_system_version = parser.read_le::<u16>()?;
        let minor_operating_system_version = parser.read_le::<u16>()?;
        let major_image_version = parser.read_le::<u16>()?;
        let minor_image_version = parser.read_le::<u16>()?;
        let major_subsystem_version = parser.read_le::<u16>()?;
        let minor_subsystem_version = parser.read_le::<u16>()?;
        let win32_version_value = parser.read_le::<u32>()?;
        let size_of_image = parser.read_le::<u32>()?;
        let size_of_headers = parser.read_le::<u32>()?;
        let checksum = parser.read_le::<u32>()?;
        let subsystem = parser.read_le::<u16>()?;
        let dll_characteristics = DllCharacteristics::from_bits_retain(parser.read_le::<u16>()?);
        let size_of_stack_reserve = parser.read_le_dyn(pe32_plus)?;
        let size_of_stack_commit = parser.read_le_dyn(pe32_plus)?;
        let size_of_heap_reserve = parser.read_le_dyn(pe32_plus)?;
        let size_of_heap_commit = parser.read_le_dyn(pe32_plus)?;
        let loader_flags = parser.read_le::<u32>()?;
        let number_of_rva_and_sizes = parser.read_le::<u32>()?;

        let table_start = parser.pos() - start;
        let room = (usize::from(declared_size).saturating_sub(table_start)) / 8;
        let count = (number_of_rva_and_sizes as usize)
            .min(DATA_DIRECTORY_COUNT)
            .min(room);

        let mut directories = Vec::with_capacity(count);
        for _ in 0..count {
            let rva = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;
            directories.push((rva, size));
        }

        if section_alignment == 0 || file_alignment == 0 {
            return Err(malformed_error!(
                "Invalid alignment - section {:#x}, file {:#x}",
                section_alignment,
                file_alignment
            ));
        }

        let header = OptionalHeader {
            pe32_plus,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            checksum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
        };
        let layout = LayoutFields {
            entry_point,
            size_of_image,
            size_of_headers,
            directories,
        };
        Ok((header, layout))
    }

    /// Write the header at `offset`, at most `declared_size` bytes. Directory slots that do
    /// not fit the declared size or `NumberOfRvaAndSizes` are not written.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
    pub fn write(
        &self,
        data: &mut [u8],
        offset: usize,
        declared_size: u16,
        layout: &LayoutFields,
    ) -> Result<()> {
        let start = offset;
        let mut offset = offset;
        let wide = self.pe32_plus;

        write_le_at(
            data,
            &mut offset,
            if wide { PE32_PLUS_MAGIC } else { PE32_MAGIC },
        )?;
        write_le_at(data, &mut offset, self.major_linker_version)?;
        write_le_at(data, &mut offset, self.minor_linker_version)?;
        write_le_at(data, &mut offset, self.size_of_code)?;
        write_le_at(data, &mut offset, self.size_of_initialized_data)?;
        write_le_at(data, &mut offset, self.size_of_uninitialized_data)?;
        write_le_at(data, &mut offset, layout.entry_point)?;
        write_le_at(data, &mut offset, self.base_of_code)?;
        if wide {
            write_le_at(data, &mut offset, self.image_base)?;
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let image_base = self.image_base as u32;
            write_le_at(data, &mut offset, self.base_of_data)?;
            write_le_at(data, &mut offset, image_base)?;
        }
        write_le_at(data, &mut offset, self.section_alignment)?;
        write_le_at(data, &mut offset, self.file_alignment)?;
        write_le_at(data, &mut offset, self.major_operating_system_version)?;
        write_le_at(data, &mut offset, self.minor_operating_system_version)?;
        write_le_at(data, &mut offset, self.major_image_version)?;
        write_le_at(data, &mut offset, self.minor_image_version)?;
        write_le_at(data, &mut offset, self.major_subsystem_version)?;
        write_le_at(data, &mut offset, self.minor_subsystem_version)?;
        write_le_at(data, &mut offset, self.win32_version_value)?;
        write_le_at(data, &mut offset, layout.size_of_image)?;
        write_le_at(data, &mut offset, layout.size_of_headers)?;
        write_le_at(data, &mut offset, self.checksum)?;
        write_le_at(data, &mut offset, self.subsystem)?;
        write_le_at(data, &mut offset, self.dll_characteristics.bits())?;
        write_le_at_dyn(data, &mut offset, self.size_of_stack_reserve, wide)?;
        write_le_at_dyn(data, &mut offset, self.size_of_stack_commit, wide)?;
        write_le_at_dyn(data, &mut offset, self.size_of_heap_reserve, wide)?;
        write_le_at_dyn(data, &mut offset, self.size_of_heap_commit, wide)?;
        write_le_at(data, &mut offset, self.loader_flags)?;
        write_le_at(data, &mut offset, self.number_of_rva_and_sizes)?;

        let room = (usize::from(declared_size).saturating_sub(offset - start)) / 8;
        let count = (self.number_of_rva_and_sizes as usize)
            .min(DATA_DIRECTORY_COUNT)
            .min(room);
        for index in 0..count {
            let (rva, size) = layout.directories.get(index).copied().unwrap_or((0, 0));
            write_le_at(data, &mut offset, rva)?;
            write_le_at(data, &mut offset, size)?;
        }
        Ok(())
    }
}

/// DOS header and stub of a freshly created image, `e_lfanew = 0x80`.
#[must_use]
pub fn default_dos_header() -> Vec<u8> {
    const STUB: &[u8] = &[
        0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21,
    ];
    const MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

    let mut header = vec![0u8; 0x80];
    let fields: [(usize, u16); 8] = [
        (0x00, DOS_MAGIC),
        (0x02, 0x90),
        (0x04, 0x03),
        (0x08, 0x04),
        (0x0C, 0xFFFF),
        (0x10, 0xB8),
        (0x18, 0x40),
        (E_LFANEW_OFFSET, 0x80),
    ];
    for (offset, value) in fields {
        header[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
    header[0x40..0x40 + STUB.len()].copy_from_slice(STUB);
    let message_start = 0x40 + STUB.len();
    header[message_start..message_start + MESSAGE.len()].copy_from_slice(MESSAGE);
    header
}

/// PE checksum of `data` as computed by `CheckSumMappedFile`; the stored checksum at
/// `checksum_offset` is skipped.
#[must_use]
pub fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let mut offset = 0;
    while offset < data.len() {
        if offset == checksum_offset {
            offset += 4;
            continue;
        }
        let low = data[offset];
        let high = data.get(offset + 1).copied().unwrap_or(0);
        sum += u64::from(u16::from_le_bytes([low, high]));
        sum = (sum & 0xFFFF) + (sum >> 16);
        offset += 2;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);

    #[allow(clippy::cast_possible_truncation)]
    let folded = (sum & 0xFFFF) as u32;
    folded.wrapping_add(u32::try_from(data.len()).unwrap_or(u32::MAX))
}
