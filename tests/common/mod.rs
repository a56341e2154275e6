//! Small images for the integration tests, built through the public API.

#![allow(dead_code)]

use peweld::prelude::*;

pub const HOST_BASE: u64 = 0x40_0000;
pub const GUEST_BASE: u64 = 0x1000_0000;

pub const HOST_ENTRY: u32 = 0x1000;
pub const HOST_KERNEL32_IAT: u32 = 0x2000;
pub const HOST_GUEST_IAT: u32 = 0x2010;

pub const GUEST_DLLMAIN: u32 = 0x1000;
pub const GUEST_EXPORT: u32 = 0x1010;
pub const GUEST_TLS_CALLBACK: u32 = 0x1020;
pub const GUEST_POINTER: u32 = 0x2000;
pub const GUEST_IAT: u32 = 0x2010;
pub const GUEST_TLS_INDEX: u32 = 0x2020;
pub const GUEST_TLS_TEMPLATE: u32 = 0x2030;

fn place(image: &mut PeImage, name: &str, flags: SectionFlags, rva: u32, data: Vec<u8>) {
    let size = u32::try_from(data.len()).unwrap();
    image
        .sections_mut()
        .place_section(Section::with_address(name, flags, rva, size, data))
        .unwrap();
}

fn at(image: &PeImage, rva: u32, len: u32) -> DataRef {
    image.data_ref(rva, len).unwrap()
}

/// Serialize `image` and parse it back.
pub fn reparse(image: &mut PeImage) -> PeImage {
    PeImage::parse(&image.to_bytes().unwrap()).unwrap()
}

/// x86 executable: `call [guest_export]`, `jmp [ExitProcess]`.
pub fn host_exe() -> PeImage {
    let mut image = PeImage::new(Machine::I386, ImageKind::Executable);
    image.optional_mut().image_base = HOST_BASE;

    let mut text = vec![0xCC; 0x100];
    text[..12].copy_from_slice(&[
        0xFF, 0x15, 0x10, 0x20, 0x40, 0x00, // call [guest_export]
        0xFF, 0x25, 0x00, 0x20, 0x40, 0x00, // jmp [ExitProcess]
    ]);
    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".rdata", SectionFlags::DATA, 0x2000, vec![0; 0x100]);

    let imports = ImportDirectory {
        descriptors: vec![
            ImportDescriptor::new(
                "KERNEL32.dll",
                vec![ImportEntry::named("ExitProcess")],
                at(&image, HOST_KERNEL32_IAT, 4),
            ),
            ImportDescriptor::new(
                "weld.dll",
                vec![ImportEntry::named("weld_export")],
                at(&image, HOST_GUEST_IAT, 4),
            ),
        ],
    };
    image.set_directory(DirectoryKind::Import, Some(Directory::Imports(imports)));

    let mut relocations = RelocationTable::new();
    relocations.add(HOST_ENTRY + 2, RelocationType::HighLow);
    relocations.add(HOST_ENTRY + 8, RelocationType::HighLow);
    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(Directory::Relocations(relocations)),
    );

    let entry = at(&image, HOST_ENTRY, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}

/// x86 `weld.dll` with one export, one import, a relocated pointer and a TLS callback.
pub fn guest_dll() -> PeImage {
    let mut image = PeImage::new(Machine::I386, ImageKind::Dll);
    image.optional_mut().image_base = GUEST_BASE;

    let mut text = vec![0xCC; 0x100];
    text[..8].copy_from_slice(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC2, 0x0C, 0x00]);
    text[0x10..0x16].copy_from_slice(&[0xA1, 0x00, 0x20, 0x00, 0x10, 0xC3]);
    text[0x20..0x23].copy_from_slice(&[0xC2, 0x0C, 0x00]);
    let mut data = vec![0u8; 0x100];
    data[..4].copy_from_slice(&0x1000_1010u32.to_le_bytes());
    data[0x30..0x38].copy_from_slice(b"WELDTLS!");

    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".data", SectionFlags::DATA, 0x2000, data);

    let mut exports = ExportDirectory::new("weld.dll");
    let index = exports.add_function(Some(ExportTarget::Symbol(at(&image, GUEST_EXPORT, 1))));
    exports.add_name("weld_export", index);
    image.set_directory(DirectoryKind::Export, Some(Directory::Exports(exports)));

    let imports = ImportDirectory {
        descriptors: vec![ImportDescriptor::new(
            "KERNEL32.dll",
            vec![ImportEntry::named("GetTickCount")],
            at(&image, GUEST_IAT, 4),
        )],
    };
    image.set_directory(DirectoryKind::Import, Some(Directory::Imports(imports)));

    let mut relocations = RelocationTable::new();
    relocations.add(GUEST_EXPORT + 1, RelocationType::HighLow);
    relocations.add(GUEST_POINTER, RelocationType::HighLow);
    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(Directory::Relocations(relocations)),
    );

    let tls = TlsDirectory {
        raw_data: at(&image, GUEST_TLS_TEMPLATE, 8),
        index: at(&image, GUEST_TLS_INDEX, 4),
        callbacks: vec![at(&image, GUEST_TLS_CALLBACK, 1)],
        size_of_zero_fill: 0,
        characteristics: 0,
    };
    image.set_directory(DirectoryKind::Tls, Some(Directory::Tls(tls)));

    let entry = at(&image, GUEST_DLLMAIN, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}
