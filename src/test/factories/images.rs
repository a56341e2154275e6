//! Synthetic host executables and guest DLLs.
//!
//! The images are assembled section by section through the public model, serialized once
//! and parsed back, so tests see them exactly as they would see a file from disk: clean
//! directories, a `.pedata` section holding the encoded directories and a `.reloc`
//! section.

use crate::{
    directories::{
        delay::{DelayImportDescriptor, DelayImportDirectory},
        exceptions::{ExceptionTable, RuntimeFunction, UnwindData},
        exports::{ExportDirectory, ExportTarget},
        imports::{ImportDescriptor, ImportDirectory, ImportEntry},
        relocations::{RelocationTable, RelocationType},
        resources::{ResourceData, ResourceDirectory, ResourceKey, ResourceNode, ResourceTable},
        tls::TlsDirectory,
        Directory, DirectoryKind,
    },
    image::{
        headers::{ImageKind, Machine},
        DataRef, PeImage, Section, SectionFlags,
    },
};

/// Preferred base of the x86 guest.
pub const GUEST_BASE: u64 = 0x1000_0000;
/// Preferred base of the x64 guest.
pub const GUEST64_BASE: u64 = 0x1_8000_0000;
/// Preferred base of the x86 host.
pub const HOST_BASE: u64 = 0x40_0000;
/// Preferred base of the x64 host.
pub const HOST64_BASE: u64 = 0x1_4000_0000;

/// Guest `DllMain`
pub const GUEST_DLLMAIN: u32 = 0x1000;
/// Exported `guest_add`, reads the global through an absolute address
pub const GUEST_ADD: u32 = 0x1010;
/// The guest's TLS callback
pub const GUEST_TLS_CALLBACK: u32 = 0x1020;
/// `mov eax, fs:[0x2C]` followed by the TLS slot lookup, exported by ordinal 2
pub const GUEST_TLS_READER: u32 = 0x1030;
/// `mov ecx, fs:[0x2C]`
pub const GUEST_TLS_READER_ECX: u32 = 0x1040;
/// x64 exception handler referenced from the unwind info
pub const GUEST64_HANDLER: u32 = 0x1030;
/// A 32-bit global
pub const GUEST_GLOBAL: u32 = 0x2000;
/// Pointer to `guest_add`, relocated
pub const GUEST_FUNCTION_POINTER: u32 = 0x2004;
/// The guest's import address table (`KERNEL32.dll!GetTickCount`)
pub const GUEST_IAT: u32 = 0x2010;
/// `_tls_index`
pub const GUEST_TLS_INDEX: u32 = 0x2020;
/// TLS template data
pub const GUEST_TLS_TEMPLATE: u32 = 0x2030;
/// Zero fill appended to the template
pub const GUEST_TLS_ZERO_FILL: u32 = 8;
/// Template contents
pub const GUEST_TLS_DATA: &[u8; 8] = b"TLSDATA!";
/// x64 unwind info with an exception handler
pub const GUEST64_UNWIND: u32 = 0x3000;
/// Guest `RT_RCDATA` #1
pub const GUEST_RESOURCE: u32 = 0x3000;

/// Host entry point
pub const HOST_ENTRY: u32 = 0x1000;
/// IAT slots the host imports the guest through
pub const HOST_GUEST_IAT: u32 = 0x2000;
/// IAT of `KERNEL32.dll!ExitProcess`
pub const HOST_KERNEL32_IAT: u32 = 0x2010;
/// Host `RT_RCDATA` #1, replaced by the guest's
pub const HOST_RESOURCE_1: u32 = 0x2040;
/// Host `RT_RCDATA` #2
pub const HOST_RESOURCE_2: u32 = 0x2048;
/// Delay-load IAT slot of `guest.dll!guest_add`
pub const HOST_DELAY_IAT: u32 = 0x3000;
/// Module handle slot of the delay-load descriptor
pub const HOST_DELAY_HANDLE: u32 = 0x3010;

const RT_RCDATA: u32 = 10;
const LANG_EN_US: u32 = 0x409;

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

fn put(bytes: &mut [u8], offset: usize, data: &[u8]) {
    bytes[offset..offset + data.len()].copy_from_slice(data);
}

/// Serialize and parse back.
pub fn reparse(image: &mut PeImage) -> PeImage {
    PeImage::parse(&image.to_bytes().unwrap()).unwrap()
}

fn rcdata(entries: &[(u32, DataRef)]) -> ResourceDirectory {
    let mut ids = ResourceTable::default();
    for (id, data) in entries {
        let mut languages = ResourceTable::default();
        languages.entries.insert(
            ResourceKey::Id(LANG_EN_US),
            ResourceNode::Data(ResourceData {
                data: *data,
                code_page: 0,
                reserved: 0,
            }),
        );
        ids.entries
            .insert(ResourceKey::Id(*id), ResourceNode::Table(languages));
    }
    let mut root = ResourceTable::default();
    root.entries
        .insert(ResourceKey::Id(RT_RCDATA), ResourceNode::Table(ids));
    ResourceDirectory { root }
}

/// Resource path `RT_RCDATA/#id/en-US`.
pub fn rcdata_path(id: u32) -> Vec<ResourceKey> {
    vec![
        ResourceKey::Id(RT_RCDATA),
        ResourceKey::Id(id),
        ResourceKey::Id(LANG_EN_US),
    ]
}

fn relocations(rvas: &[u32], kind: RelocationType) -> Directory {
    let mut table = RelocationTable::new();
    for rva in rvas {
        table.add(*rva, kind);
    }
    Directory::Relocations(table)
}

/// x86 `guest.dll`: exports (`guest_add`, ordinal 2 and a forwarder), an import of
/// `KERNEL32.dll`, relocations, TLS with one callback, `fs:[0x2C]` accessors and an
/// `RT_RCDATA` resource.
pub fn guest_dll_x86() -> PeImage {
    let mut image = PeImage::new(Machine::I386, ImageKind::Dll);
    image.optional_mut().image_base = GUEST_BASE;

    let mut text = vec![0xCC; 0x200];
    put(&mut text, 0x00, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC2, 0x0C, 0x00]);
    put(&mut text, 0x10, &[0xA1, 0x00, 0x20, 0x00, 0x10, 0xC3]);
    put(&mut text, 0x20, &[0xC2, 0x0C, 0x00]);
    put(
        &mut text,
        0x30,
        &[
            0x64, 0xA1, 0x2C, 0x00, 0x00, 0x00, // mov eax, fs:[0x2C]
            0x8B, 0x0D, 0x20, 0x20, 0x00, 0x10, // mov ecx, [_tls_index]
            0x8B, 0x04, 0x88, // mov eax, [eax + ecx*4]
            0xC3,
        ],
    );
    put(&mut text, 0x40, &[0x64, 0x8B, 0x0D, 0x2C, 0x00, 0x00, 0x00, 0xC3]);

    let mut data = vec![0u8; 0x100];
    put(&mut data, 0x00, &0x1234_5678u32.to_le_bytes());
    put(&mut data, 0x04, &0x1000_1010u32.to_le_bytes());
    put(&mut data, 0x30, GUEST_TLS_DATA);

    let mut rdata = vec![0u8; 0x100];
    put(&mut rdata, 0x00, b"GST!");

    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".data", SectionFlags::DATA, 0x2000, data);
    place(&mut image, ".rdata", SectionFlags::RDATA, 0x3000, rdata);

    let mut exports = ExportDirectory::new("guest.dll");
    let add = exports.add_function(Some(ExportTarget::Symbol(at(&image, GUEST_ADD, 1))));
    exports.add_function(Some(ExportTarget::Symbol(at(&image, GUEST_TLS_READER, 1))));
    let sleep = exports.add_function(Some(ExportTarget::Forwarder("KERNEL32.Sleep".into())));
    exports.add_name("guest_add", add);
    exports.add_name("guest_sleep", sleep);
    image.set_directory(DirectoryKind::Export, Some(Directory::Exports(exports)));

    let imports = ImportDirectory {
        descriptors: vec![ImportDescriptor::new(
            "KERNEL32.dll",
            vec![ImportEntry::named("GetTickCount")],
            at(&image, GUEST_IAT, 4),
        )],
    };
    image.set_directory(DirectoryKind::Import, Some(Directory::Imports(imports)));

    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(relocations(
            &[GUEST_ADD + 1, GUEST_TLS_READER + 8, GUEST_FUNCTION_POINTER],
            RelocationType::HighLow,
        )),
    );

    let tls = TlsDirectory {
        raw_data: at(&image, GUEST_TLS_TEMPLATE, 8),
        index: at(&image, GUEST_TLS_INDEX, 4),
        callbacks: vec![at(&image, GUEST_TLS_CALLBACK, 1)],
        size_of_zero_fill: GUEST_TLS_ZERO_FILL,
        characteristics: 0,
    };
    image.set_directory(DirectoryKind::Tls, Some(Directory::Tls(tls)));

    let resources = rcdata(&[(1, at(&image, GUEST_RESOURCE, 4))]);
    image.set_directory(DirectoryKind::Resource, Some(Directory::Resources(resources)));

    let entry = at(&image, GUEST_DLLMAIN, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}

/// x86 executable importing `guest_add`, `guest.dll!#2` and the unresolvable
/// `guest_missing`, delay-loading `guest_add`, with two `RT_RCDATA` resources.
pub fn host_exe_x86() -> PeImage {
    let mut image = PeImage::new(Machine::I386, ImageKind::Executable);

    let mut text = vec![0xCC; 0x200];
    put(
        &mut text,
        0x00,
        &[
            0xFF, 0x15, 0x00, 0x20, 0x40, 0x00, // call [guest_add]
            0x6A, 0x00, // push 0
            0xFF, 0x15, 0x10, 0x20, 0x40, 0x00, // call [ExitProcess]
            0xC3,
        ],
    );
    let mut rdata = vec![0u8; 0x100];
    put(&mut rdata, 0x40, b"HST!");
    put(&mut rdata, 0x48, b"HS2!");

    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".rdata", SectionFlags::RDATA, 0x2000, rdata);
    place(&mut image, ".data", SectionFlags::DATA, 0x3000, vec![0u8; 0x100]);

    let imports = ImportDirectory {
        descriptors: vec![
            ImportDescriptor::new(
                "KERNEL32.dll",
                vec![ImportEntry::named("ExitProcess")],
                at(&image, HOST_KERNEL32_IAT, 4),
            ),
            ImportDescriptor::new(
                "guest.dll",
                vec![
                    ImportEntry::named("guest_add"),
                    ImportEntry::Ordinal(2),
                    ImportEntry::named("guest_missing"),
                ],
                at(&image, HOST_GUEST_IAT, 12),
            ),
        ],
    };
    image.set_directory(DirectoryKind::Import, Some(Directory::Imports(imports)));

    let delay = DelayImportDirectory {
        descriptors: vec![DelayImportDescriptor {
            attributes: 1,
            dll_name: "GUEST.DLL".into(),
            module_handle: at(&image, HOST_DELAY_HANDLE, 4),
            iat: at(&image, HOST_DELAY_IAT, 4),
            bound_iat: DataRef::null(),
            unload_iat: DataRef::null(),
            time_date_stamp: 0,
            entries: vec![ImportEntry::named("guest_add")],
        }],
    };
    image.set_directory(
        DirectoryKind::DelayImport,
        Some(Directory::DelayImports(delay)),
    );

    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(relocations(
            &[HOST_ENTRY + 2, HOST_ENTRY + 10],
            RelocationType::HighLow,
        )),
    );

    let resources = rcdata(&[
        (1, at(&image, HOST_RESOURCE_1, 4)),
        (2, at(&image, HOST_RESOURCE_2, 4)),
    ]);
    image.set_directory(DirectoryKind::Resource, Some(Directory::Resources(resources)));

    let entry = at(&image, HOST_ENTRY, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}

/// x64 `guest.dll` with TLS, a relocated pointer and two runtime functions sharing one
/// unwind info that names an exception handler.
pub fn guest_dll_x64() -> PeImage {
    let mut image = PeImage::new(Machine::Amd64, ImageKind::Dll);
    image.optional_mut().image_base = GUEST64_BASE;

    let mut text = vec![0xCC; 0x200];
    put(&mut text, 0x00, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
    // mov rax, [rip + GUEST_GLOBAL]
    put(&mut text, 0x10, &[0x48, 0x8B, 0x05, 0xE9, 0x0F, 0x00, 0x00, 0xC3]);
    put(&mut text, 0x20, &[0xC3]);
    put(&mut text, 0x30, &[0xC3]);

    let mut data = vec![0u8; 0x100];
    put(&mut data, 0x00, &(GUEST64_BASE + 0x1010).to_le_bytes());
    put(&mut data, 0x30, b"TLS64DAT");

    let mut rdata = vec![0u8; 0x100];
    // version 1 with EHANDLER, one UWOP_ALLOC_SMALL code padded to two, handler RVA
    put(
        &mut rdata,
        0x00,
        &[0x09, 0x04, 0x01, 0x00, 0x04, 0x42, 0x00, 0x00, 0x30, 0x10, 0x00, 0x00],
    );

    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".data", SectionFlags::DATA, 0x2000, data);
    place(&mut image, ".rdata", SectionFlags::RDATA, 0x3000, rdata);

    let mut exports = ExportDirectory::new("guest64.dll");
    let read = exports.add_function(Some(ExportTarget::Symbol(at(&image, 0x1010, 1))));
    exports.add_name("guest_read", read);
    image.set_directory(DirectoryKind::Export, Some(Directory::Exports(exports)));

    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(relocations(&[GUEST_GLOBAL], RelocationType::Dir64)),
    );

    let tls = TlsDirectory {
        raw_data: at(&image, GUEST_TLS_TEMPLATE, 8),
        index: at(&image, GUEST_TLS_INDEX, 4),
        callbacks: vec![at(&image, GUEST_TLS_CALLBACK, 1)],
        size_of_zero_fill: 0,
        characteristics: 0,
    };
    image.set_directory(DirectoryKind::Tls, Some(Directory::Tls(tls)));

    let unwind = at(&image, GUEST64_UNWIND, 4);
    let mut exceptions = ExceptionTable::new(Machine::Amd64 as u16).unwrap();
    exceptions.functions = vec![
        RuntimeFunction {
            begin: at(&image, 0x1000, 6),
            length: 6,
            unwind: UnwindData::Info(unwind),
        },
        RuntimeFunction {
            begin: at(&image, 0x1010, 8),
            length: 8,
            unwind: UnwindData::Info(unwind),
        },
    ];
    image.set_directory(
        DirectoryKind::Exception,
        Some(Directory::Exceptions(exceptions)),
    );

    let entry = at(&image, GUEST_DLLMAIN, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}

/// x64 executable importing `guest64.dll!guest_read`.
pub fn host_exe_x64() -> PeImage {
    let mut image = PeImage::new(Machine::Amd64, ImageKind::Executable);

    let mut text = vec![0xCC; 0x200];
    put(
        &mut text,
        0x00,
        &[
            0x48, 0x83, 0xEC, 0x28, // sub rsp, 0x28
            0xFF, 0x15, 0xF6, 0x0F, 0x00, 0x00, // call [rip + HOST_GUEST_IAT]
            0x48, 0x83, 0xC4, 0x28, // add rsp, 0x28
            0xC3,
        ],
    );
    let mut data = vec![0u8; 0x100];
    put(&mut data, 0x00, &(HOST64_BASE + 0x1000).to_le_bytes());

    place(&mut image, ".text", SectionFlags::CODE, 0x1000, text);
    place(&mut image, ".rdata", SectionFlags::RDATA, 0x2000, vec![0u8; 0x100]);
    place(&mut image, ".data", SectionFlags::DATA, 0x3000, data);

    let imports = ImportDirectory {
        descriptors: vec![
            ImportDescriptor::new(
                "guest64.dll",
                vec![ImportEntry::named("guest_read")],
                at(&image, HOST_GUEST_IAT, 8),
            ),
            ImportDescriptor::new(
                "KERNEL32.dll",
                vec![ImportEntry::named("ExitProcess")],
                at(&image, HOST_KERNEL32_IAT, 8),
            ),
        ],
    };
    image.set_directory(DirectoryKind::Import, Some(Directory::Imports(imports)));
    image.set_directory(
        DirectoryKind::BaseRelocation,
        Some(relocations(&[0x3000], RelocationType::Dir64)),
    );

    let entry = at(&image, HOST_ENTRY, 1);
    image.set_entry_point(entry);
    reparse(&mut image)
}
