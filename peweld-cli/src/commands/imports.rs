use std::path::Path;

use peweld::directories::imports::ImportEntry;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{hex, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct ImportedDll {
    dll: String,
    delay_loaded: bool,
    iat: String,
    functions: Vec<String>,
}

fn entry_name(entry: &ImportEntry) -> String {
    match entry {
        ImportEntry::Ordinal(ordinal) => format!("#{ordinal}"),
        ImportEntry::Name { name, .. } => name.clone(),
    }
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let store = image.sections();

    let mut dlls = Vec::new();
    if let Some(imports) = image.imports() {
        for descriptor in &imports.descriptors {
            dlls.push(ImportedDll {
                dll: descriptor.dll_name.clone(),
                delay_loaded: false,
                iat: descriptor
                    .first_thunk
                    .try_rva(store)
                    .map_or_else(|| "-".to_string(), hex),
                functions: descriptor.entries.iter().map(entry_name).collect(),
            });
        }
    }
    if let Some(delay) = image.delay_imports() {
        for descriptor in &delay.descriptors {
            dlls.push(ImportedDll {
                dll: descriptor.dll_name.clone(),
                delay_loaded: true,
                iat: descriptor
                    .iat
                    .try_rva(store)
                    .map_or_else(|| "-".to_string(), hex),
                functions: descriptor.entries.iter().map(entry_name).collect(),
            });
        }
    }

    print_output(&dlls, opts, |dlls| {
        if dlls.is_empty() {
            println!("Imports: none");
            return;
        }
        println!("Imports ({} DLLs):", dlls.len());
        let mut tw = TabWriter::new(vec![
            ("DLL", Align::Left),
            ("IAT", Align::Right),
            ("Count", Align::Right),
            ("Functions", Align::Left),
        ])
        .indent("  ");
        for dll in dlls {
            let name = if dll.delay_loaded {
                format!("{} (delay)", dll.dll)
            } else {
                dll.dll.clone()
            };
            tw.row(vec![
                name,
                dll.iat.clone(),
                dll.functions.len().to_string(),
                dll.functions.join(", "),
            ]);
        }
        tw.print();
    })
}
