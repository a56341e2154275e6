//! Parse → write round trips and cross-checks of written images with goblin.

mod common;

use common::{guest_dll, host_exe, GUEST_EXPORT, HOST_BASE, HOST_ENTRY};
use peweld::prelude::*;

#[test]
fn unmodified_image_is_byte_identical() -> Result<()> {
    let mut host = host_exe();
    let bytes = host.to_bytes()?;

    let mut parsed = PeImage::parse(&bytes)?;
    assert_eq!(parsed.to_bytes()?, bytes);
    Ok(())
}

#[test]
fn goblin_reads_written_directories() -> Result<()> {
    let mut guest = guest_dll();
    let bytes = guest.to_bytes()?;

    let pe = goblin::pe::PE::parse(&bytes)?;
    assert!(pe.is_lib);
    assert_eq!(pe.entry, 0x1000);
    assert_eq!(pe.exports.len(), 1);
    assert_eq!(pe.exports[0].name, Some("weld_export"));
    assert_eq!(pe.exports[0].rva, GUEST_EXPORT as usize);
    assert!(pe
        .imports
        .iter()
        .any(|import| import.dll == "KERNEL32.dll" && import.name == "GetTickCount"));
    Ok(())
}

#[test]
fn written_file_matches_memory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("host.exe");

    let mut host = host_exe();
    host.write_to_file(&path)?;
    let on_disk = std::fs::read(&path)?;
    assert_eq!(on_disk, host.to_bytes()?);

    let loaded = PeImage::from_file(&path)?;
    assert_eq!(loaded.image_base(), HOST_BASE);
    assert_eq!(loaded.entry_point_rva(), Some(HOST_ENTRY));
    Ok(())
}

#[test]
fn added_section_is_visible_to_goblin() -> Result<()> {
    let mut host = host_exe();
    let rva = host
        .sections()
        .find_section_space(0x80)
        .ok_or(Error::NoAddressSpace { size: 0x80 })?;
    host.sections_mut().place_section(Section::with_address(
        ".extra",
        SectionFlags::DATA,
        rva,
        0x80,
        vec![0xAA; 0x80],
    ))?;
    let bytes = host.to_bytes()?;

    let pe = goblin::pe::PE::parse(&bytes)?;
    let extra = pe
        .sections
        .iter()
        .find(|section| section.name().ok() == Some(".extra"))
        .map(|section| (section.virtual_address, section.pointer_to_raw_data));
    let (virtual_address, raw) = extra.ok_or(Error::Empty)?;
    assert_eq!(virtual_address, rva);
    assert_eq!(bytes[raw as usize], 0xAA);

    let reparsed = PeImage::parse(&bytes)?;
    assert_eq!(reparsed.read(rva, 4)?, vec![0xAA; 4]);
    Ok(())
}
