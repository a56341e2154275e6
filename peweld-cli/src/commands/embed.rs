use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use peweld::{EmbedOptions, Embedder};
use serde::Serialize;

use crate::{
    app::{EmbedFlags, GlobalOptions},
    commands::common::{file_display_name, hex, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct GuestOutput {
    name: String,
    embed_base: String,
    sections: usize,
    imports_merged: usize,
    exports_merged: usize,
    export_collisions: Vec<String>,
    delay_imports_merged: usize,
    resources_replaced: Vec<String>,
    relocations_applied: usize,
    injected_by_name: usize,
    injected_by_ordinal: usize,
    tls_patches: usize,
    tls_callbacks: usize,
    exception_functions_merged: usize,
    stub: String,
    previous_entry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dll_main: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedOutput {
    host: String,
    output: String,
    entry_point: String,
    size_of_image: String,
    guests: Vec<GuestOutput>,
}

fn options(flags: &EmbedFlags) -> EmbedOptions {
    EmbedOptions::default()
        .with_fix_entry_point(flags.fix_entry_point)
        .with_inject_imports(flags.inject_imports)
        .with_merge_exports(!flags.no_exports)
        .with_merge_resources(!flags.no_resources)
        .with_merge_delay_imports(!flags.no_delay_imports)
        .with_patch_static_tls(!flags.no_tls_patch)
        .with_merge_exception_table(!flags.no_exception_merge)
}

pub fn run(
    host_path: &Path,
    paths: &[PathBuf],
    flags: &EmbedFlags,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let Some((output_path, guest_paths)) = paths.split_last() else {
        bail!("expected at least one guest and an output path");
    };
    if guest_paths.is_empty() {
        bail!("expected at least one guest before the output path");
    }

    let mut host = load_image(host_path)?;
    let mut guests = Vec::with_capacity(guest_paths.len());
    {
        let mut embedder = Embedder::new(&mut host).with_options(options(flags));
        for guest_path in guest_paths {
            let guest = load_image(guest_path)?;
            let name = file_display_name(guest_path);
            let report = embedder
                .embed(&guest, &name)
                .with_context(|| format!("failed to embed {}", guest_path.display()))?;

            guests.push(GuestOutput {
                name: report.guest_name.clone(),
                embed_base: hex(report.embed_base),
                sections: report.sections,
                imports_merged: report.imports_merged,
                exports_merged: report.exports_merged,
                export_collisions: report.export_collisions.clone(),
                delay_imports_merged: report.delay_imports_merged,
                resources_replaced: report
                    .resource_collisions
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                relocations_applied: report.relocations_applied,
                injected_by_name: report.injected_by_name,
                injected_by_ordinal: report.injected_by_ordinal,
                tls_patches: report.tls_patches,
                tls_callbacks: report.tls_callbacks,
                exception_functions_merged: report.exception_functions_merged,
                stub: hex(report.stub_rva),
                previous_entry: hex(report.previous_entry),
                dll_main: report.dll_main.map(hex),
            });
        }
    }

    host.write_to_file(output_path)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let output = EmbedOutput {
        host: file_display_name(host_path),
        output: output_path.display().to_string(),
        entry_point: host.entry_point_rva().map_or_else(|| "-".to_string(), hex),
        size_of_image: hex(host.size_of_image()),
        guests,
    };

    print_output(&output, opts, |out| {
        println!("{} -> {}", out.host, out.output);
        println!("  Entry point:    {}", out.entry_point);
        println!("  Size of image:  {}", out.size_of_image);
        println!();

        let mut tw = TabWriter::new(vec![
            ("Guest", Align::Left),
            ("Base", Align::Right),
            ("Sections", Align::Right),
            ("Relocs", Align::Right),
            ("Exports", Align::Right),
            ("Injected", Align::Right),
            ("TLS", Align::Right),
            ("Stub", Align::Right),
        ])
        .indent("  ");
        for guest in &out.guests {
            tw.row(vec![
                guest.name.clone(),
                guest.embed_base.clone(),
                guest.sections.to_string(),
                guest.relocations_applied.to_string(),
                guest.exports_merged.to_string(),
                (guest.injected_by_name + guest.injected_by_ordinal).to_string(),
                format!("{}/{}", guest.tls_patches, guest.tls_callbacks),
                guest.stub.clone(),
            ]);
        }
        tw.print();

        for guest in &out.guests {
            for name in &guest.export_collisions {
                println!("  {}: export {name} kept from the host", guest.name);
            }
            for path in &guest.resources_replaced {
                println!("  {}: resource {path} replaced", guest.name);
            }
        }
    })
}
