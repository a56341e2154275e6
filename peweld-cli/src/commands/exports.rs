use std::path::Path;

use peweld::directories::exports::ExportTarget;
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{hex, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct ExportEntry {
    ordinal: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    target: String,
}

#[derive(Debug, Serialize)]
struct ExportsOutput {
    dll_name: Option<String>,
    ordinal_base: u32,
    exports: Vec<ExportEntry>,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let image = load_image(path)?;

    let output = match image.exports() {
        Some(exports) => ExportsOutput {
            dll_name: Some(exports.dll_name.clone()),
            ordinal_base: exports.ordinal_base,
            exports: exports
                .iter()
                .map(|(ordinal, name, target)| ExportEntry {
                    ordinal,
                    name: name.map(str::to_string),
                    target: match target {
                        ExportTarget::Symbol(data) => data
                            .try_rva(image.sections())
                            .map_or_else(|| "-".to_string(), hex),
                        ExportTarget::Forwarder(forwarder) => format!("-> {forwarder}"),
                    },
                })
                .collect(),
        },
        None => ExportsOutput {
            dll_name: None,
            ordinal_base: 0,
            exports: Vec::new(),
        },
    };

    print_output(&output, opts, |out| {
        if out.exports.is_empty() {
            println!("Exports: none");
            return;
        }
        println!(
            "Exports of {} ({} entries, ordinal base {}):",
            out.dll_name.as_deref().unwrap_or("(unnamed)"),
            out.exports.len(),
            out.ordinal_base
        );
        let mut tw = TabWriter::new(vec![
            ("Ordinal", Align::Right),
            ("Name", Align::Left),
            ("Target", Align::Left),
        ])
        .indent("  ");
        for entry in &out.exports {
            tw.row(vec![
                entry.ordinal.to_string(),
                entry.name.clone().unwrap_or_else(|| "-".to_string()),
                entry.target.clone(),
            ]);
        }
        tw.print();
    })
}
