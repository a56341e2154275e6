//! End-to-end embedding: build a host and a guest, weld them, write the result and
//! inspect it with goblin and iced-x86.

mod common;

use common::{
    guest_dll, host_exe, GUEST_DLLMAIN, GUEST_EXPORT, GUEST_POINTER, GUEST_TLS_CALLBACK,
    HOST_BASE, HOST_ENTRY, HOST_GUEST_IAT,
};
use iced_x86::{Decoder, DecoderOptions, FlowControl};
use peweld::prelude::*;

/// Direct call targets and the final jump target of the code at `rva`.
fn trace_stub(image: &PeImage, rva: u32) -> (Vec<u64>, u64) {
    let (id, offset) = image.sections().find_section_by_rva(rva, 1).unwrap();
    let section = image.sections().get(id).unwrap();
    assert_eq!(section.name(), ".stub");
    let code = &section.data()[offset as usize..];
    let mut decoder = Decoder::with_ip(
        32,
        code,
        image.image_base() + u64::from(rva),
        DecoderOptions::NONE,
    );
    let mut calls = Vec::new();
    while decoder.can_decode() {
        let instruction = decoder.decode();
        match instruction.flow_control() {
            FlowControl::Call if instruction.is_call_near() => {
                calls.push(instruction.near_branch_target());
            }
            FlowControl::UnconditionalBranch => {
                return (calls, instruction.near_branch_target())
            }
            _ => {}
        }
    }
    panic!("trampoline does not end in a jump");
}

#[test]
fn welded_image_runs_guest_first() -> Result<()> {
    let mut host = host_exe();
    let guest = guest_dll();
    let host_size = host.size_of_image();

    let report = Embedder::new(&mut host).embed(&guest, "weld.dll")?;
    let base = report.embed_base;
    assert!(base >= host_size);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("welded.exe");
    host.write_to_file(&path)?;
    let bytes = std::fs::read(&path)?;

    let pe = goblin::pe::PE::parse(&bytes)?;
    assert_eq!(pe.entry, report.stub_rva);
    let names: Vec<&str> = pe
        .sections
        .iter()
        .filter_map(|section| section.name().ok())
        .collect();
    assert!(names.contains(&".meta"));
    assert!(names.contains(&".stub"));
    let size_of_image = pe
        .header
        .optional_header
        .map(|header| header.windows_fields.size_of_image)
        .unwrap_or(0);
    assert!(size_of_image >= base + guest.size_of_image());
    assert!(pe
        .imports
        .iter()
        .any(|import| import.name == "GetTickCount"));
    assert!(pe
        .exports
        .iter()
        .any(|export| export.name == Some("weld_export")));

    let welded = PeImage::parse(&bytes)?;
    let (calls, next) = trace_stub(&welded, report.stub_rva);
    assert_eq!(
        calls,
        vec![
            HOST_BASE + u64::from(base + GUEST_TLS_CALLBACK),
            HOST_BASE + u64::from(base + GUEST_DLLMAIN),
        ]
    );
    assert_eq!(next, HOST_BASE + u64::from(HOST_ENTRY));

    // The guest's data pointer follows the guest to its new address
    let pointer = welded.read(base + GUEST_POINTER, 4)?;
    let pointer = u32::from_le_bytes([pointer[0], pointer[1], pointer[2], pointer[3]]);
    assert_eq!(
        u64::from(pointer),
        HOST_BASE + u64::from(base + GUEST_EXPORT)
    );
    Ok(())
}

#[test]
fn injected_import_points_into_guest() -> Result<()> {
    let mut host = host_exe();
    let guest = guest_dll();

    let report = Embedder::new(&mut host)
        .with_options(EmbedOptions::default().with_inject_imports(true))
        .embed(&guest, "WELD.DLL")?;
    assert_eq!(report.injected(), 1);

    let bytes = host.to_bytes()?;
    let pe = goblin::pe::PE::parse(&bytes)?;
    assert!(!pe
        .libraries
        .iter()
        .any(|library| library.eq_ignore_ascii_case("weld.dll")));

    let welded = PeImage::parse(&bytes)?;
    let slot = welded.read(HOST_GUEST_IAT, 4)?;
    let slot = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    assert_eq!(
        u64::from(slot),
        HOST_BASE + u64::from(report.embed_base + GUEST_EXPORT)
    );
    assert_eq!(
        welded.relocations().and_then(|table| table.get(HOST_GUEST_IAT)),
        Some(RelocationType::HighLow)
    );
    Ok(())
}

#[test]
fn dll_host_is_rejected() {
    let mut host = guest_dll();
    let guest = guest_dll();
    let result = Embedder::new(&mut host).embed(&guest, "weld.dll");
    assert!(matches!(result, Err(Error::NotAnExecutable)));
    assert_eq!(Error::NotAnExecutable.exit_code(), -4);
}
