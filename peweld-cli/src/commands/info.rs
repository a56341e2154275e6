use std::path::Path;

use peweld::directories::DirectoryKind;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{file_display_name, hex, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: String,
    pub virtual_size: String,
    pub raw_size: String,
    pub characteristics: String,
}

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub file: String,
    pub machine: String,
    pub format: String,
    pub kind: String,
    pub image_base: String,
    pub entry_point: String,
    pub size_of_image: String,
    pub section_alignment: String,
    pub file_alignment: String,
    pub relocatable: bool,
    pub overlay_size: usize,
    pub sections: Vec<SectionInfo>,
    pub directories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb: Option<String>,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let image = load_image(path)?;

    let machine = image
        .coff()
        .known_machine()
        .map_or_else(|| format!("{:#06x}", image.machine()), |m| m.to_string());

    let sections = image
        .sections()
        .iter()
        .map(|(_, section)| SectionInfo {
            name: section.name(),
            virtual_address: section.virtual_address().map_or_else(|| "-".to_string(), hex),
            virtual_size: hex(section.virtual_size()),
            raw_size: hex(section.raw_info().size_of_raw_data),
            characteristics: format!("{:#010x}", section.characteristics().bits()),
        })
        .collect();

    let directories = (0..16u8)
        .filter_map(DirectoryKind::from_repr)
        .filter(|kind| image.directory(*kind).is_some())
        .map(|kind| kind.to_string())
        .collect();

    let pdb = image
        .debug()
        .and_then(|debug| debug.codeview(image.sections()))
        .map(|codeview| format!("{} ({} age {})", codeview.path, codeview.guid, codeview.age));

    let info = ImageInfo {
        file: file_display_name(path),
        machine,
        format: if image.is_pe32_plus() { "PE32+" } else { "PE32" }.to_string(),
        kind: if image.is_dll() { "dll" } else { "exe" }.to_string(),
        image_base: hex(image.image_base()),
        entry_point: image.entry_point_rva().map_or_else(|| "-".to_string(), hex),
        size_of_image: hex(image.size_of_image()),
        section_alignment: hex(image.optional().section_alignment),
        file_alignment: hex(image.optional().file_alignment),
        relocatable: image.is_relocatable(),
        overlay_size: image.overlay().len(),
        sections,
        directories,
        pdb,
    };

    print_output(&info, opts, |info| {
        println!("{}", info.file);
        println!("  Machine:        {} ({})", info.machine, info.format);
        println!("  Kind:           {}", info.kind);
        println!("  Image base:     {}", info.image_base);
        println!("  Entry point:    {}", info.entry_point);
        println!("  Size of image:  {}", info.size_of_image);
        println!(
            "  Alignment:      {} section, {} file",
            info.section_alignment, info.file_alignment
        );
        println!("  Relocatable:    {}", info.relocatable);
        if info.overlay_size > 0 {
            println!("  Overlay:        {} bytes", info.overlay_size);
        }
        if let Some(pdb) = &info.pdb {
            println!("  PDB:            {pdb}");
        }

        println!("\nSections ({}):", info.sections.len());
        let mut tw = TabWriter::new(vec![
            ("Name", Align::Left),
            ("RVA", Align::Right),
            ("VirtSize", Align::Right),
            ("RawSize", Align::Right),
            ("Flags", Align::Right),
        ])
        .indent("  ");
        for section in &info.sections {
            tw.row(vec![
                section.name.clone(),
                section.virtual_address.clone(),
                section.virtual_size.clone(),
                section.raw_size.clone(),
                section.characteristics.clone(),
            ]);
        }
        tw.print();

        println!("\nDirectories: {}", info.directories.join(", "));
    })
}
