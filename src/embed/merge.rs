//! Directory merging: the guest's imports, exports, delay-load descriptors, resources and
//! runtime functions are cloned, translated into the host and appended to (or installed
//! as) the host's directories.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::{
    directories::{
        delay::DelayImportDirectory,
        exceptions::{unwind_info_rva_fields, ExceptionTable, RuntimeFunction, UnwindData},
        exports::{ExportDirectory, ExportTarget},
        imports::ImportDirectory,
        resources::ResourceDirectory,
        Directory, DirectoryKind,
    },
    embed::{link::LinkMap, report::EmbedReport},
    image::{headers::Machine, PeImage, SectionFlags},
    Result,
};

/// Drop the host's bound imports and clear the binding fields of its descriptors; the
/// IAT contents are rewritten once the import directory is re-encoded.
pub(crate) fn unbind_imports(host: &mut PeImage) {
    if host.directory(DirectoryKind::BoundImport).is_some() {
        debug!("dropping bound imports");
        host.set_directory(DirectoryKind::BoundImport, None);
    }
    if let Some(imports) = host.imports_mut() {
        for descriptor in &mut imports.descriptors {
            descriptor.time_date_stamp = 0;
            descriptor.forwarder_chain = 0;
        }
    }
}

/// Append the guest's import descriptors. Their IATs stay in the transplanted sections,
/// which become writable.
pub(crate) fn merge_imports(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    report: &mut EmbedReport,
) -> Result<()> {
    unbind_imports(host);
    let Some(imports) = guest.imports() else {
        return Ok(());
    };

    let mut descriptors = Vec::with_capacity(imports.descriptors.len());
    for descriptor in &imports.descriptors {
        let first_thunk = link.translate(descriptor.first_thunk);
        if first_thunk.is_null() {
            warn!(
                "skipping import of {} whose IAT lies outside the guest sections",
                descriptor.dll_name
            );
            continue;
        }
        let mut merged = descriptor.clone();
        merged.first_thunk = first_thunk;
        merged.time_date_stamp = 0;
        merged.forwarder_chain = 0;
        descriptors.push(merged);
    }

    let writable: BTreeSet<_> = descriptors
        .iter()
        .filter_map(|descriptor| descriptor.first_thunk.section_id())
        .collect();
    for id in writable {
        if let Some(section) = host.sections_mut().get_mut(id) {
            section.add_characteristics(SectionFlags::MEM_WRITE);
        }
    }

    report.imports_merged = descriptors.len();
    match host.imports_mut() {
        Some(existing) => existing.descriptors.extend(descriptors),
        None => host.set_directory(
            DirectoryKind::Import,
            Some(Directory::Imports(ImportDirectory { descriptors })),
        ),
    }
    Ok(())
}

/// Append the guest's export slots after the host's; names follow their slot. A name the
/// host already exports keeps pointing at the host's function.
pub(crate) fn merge_exports(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    report: &mut EmbedReport,
) -> Result<()> {
    let Some(exports) = guest.exports() else {
        return Ok(());
    };

    if host.exports().is_none() {
        let mut directory = ExportDirectory::new(&exports.dll_name);
        directory.ordinal_base = exports.ordinal_base;
        host.set_directory(DirectoryKind::Export, Some(Directory::Exports(directory)));
    }
    let Some(directory) = host.exports_mut() else {
        return Err(internal_error!("export directory vanished while merging"));
    };

    let offset = u32::try_from(directory.functions.len()).unwrap_or(u32::MAX);
    for function in &exports.functions {
        let translated = function.as_ref().map(|target| match target {
            ExportTarget::Symbol(data) => ExportTarget::Symbol(link.translate(*data)),
            ExportTarget::Forwarder(forwarder) => ExportTarget::Forwarder(forwarder.clone()),
        });
        directory.add_function(translated);
    }
    for (name, index) in &exports.names {
        if !directory.add_name(name, index + offset) {
            warn!("export {name} of {} is shadowed by the host", report.guest_name);
            report.export_collisions.push(name.clone());
        }
    }

    report.exports_merged = exports.functions.len();
    Ok(())
}

/// Append the guest's delay-load descriptors with every reference translated.
pub(crate) fn merge_delay_imports(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    report: &mut EmbedReport,
) -> Result<()> {
    let Some(delay) = guest.delay_imports() else {
        return Ok(());
    };

    let descriptors: Vec<_> = delay
        .descriptors
        .iter()
        .map(|descriptor| {
            let mut merged = descriptor.clone();
            merged.module_handle = link.translate(descriptor.module_handle);
            merged.iat = link.translate(descriptor.iat);
            merged.bound_iat = link.translate(descriptor.bound_iat);
            merged.unload_iat = link.translate(descriptor.unload_iat);
            merged.time_date_stamp = 0;
            merged
        })
        .collect();

    report.delay_imports_merged = descriptors.len();
    match host.delay_imports_mut() {
        Some(existing) => existing.descriptors.extend(descriptors),
        None => host.set_directory(
            DirectoryKind::DelayImport,
            Some(Directory::DelayImports(DelayImportDirectory { descriptors })),
        ),
    }
    Ok(())
}

/// Merge the guest's resource tree into the host's. Guest leaves win every collision.
pub(crate) fn merge_resources(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    report: &mut EmbedReport,
) -> Result<()> {
    let Some(resources) = guest.resources() else {
        return Ok(());
    };

    let mut root = resources.root.clone();
    root.for_each_data_mut(&mut |leaf| leaf.data = link.translate(leaf.data));

    match host.resources_mut() {
        Some(existing) => {
            let collisions = existing.root.merge(root);
            for collision in &collisions {
                warn!(
                    "resource {collision} of the host replaced by {}",
                    report.guest_name
                );
            }
            report.resource_collisions = collisions;
        }
        None => host.set_directory(
            DirectoryKind::Resource,
            Some(Directory::Resources(ResourceDirectory { root })),
        ),
    }
    Ok(())
}

/// Append the guest's x64 runtime functions to the host's exception table.
///
/// The records themselves are re-encoded from references, but `UNWIND_INFO` blocks are
/// copied verbatim with the guest, so the handler and chained-function RVAs inside them
/// are moved by `embed_base` here, once per block.
pub(crate) fn merge_exception_table(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    report: &mut EmbedReport,
) -> Result<()> {
    if guest.machine() != Machine::Amd64 as u16 {
        return Ok(());
    }
    let Some(table) = guest.exceptions() else {
        return Ok(());
    };

    let functions: Vec<RuntimeFunction> = table
        .functions
        .iter()
        .map(|function| RuntimeFunction {
            begin: link.translate(function.begin),
            length: function.length,
            unwind: match function.unwind {
                UnwindData::Info(data) => UnwindData::Info(link.translate(data)),
                UnwindData::Chained(data) => UnwindData::Chained(link.translate(data)),
                UnwindData::Packed(word) => UnwindData::Packed(word),
            },
        })
        .collect();

    let mut infos = BTreeSet::new();
    let mut chained = BTreeSet::new();
    for function in &functions {
        match function.unwind {
            UnwindData::Info(data) => infos.extend(data.try_rva(host.sections())),
            UnwindData::Chained(data) => chained.extend(data.try_rva(host.sections())),
            UnwindData::Packed(_) => {}
        }
    }

    let embed_base = link.embed_base();
    for info in infos {
        for field in unwind_rva_fields(host, info)? {
            shift_rva(host, info + field, embed_base)?;
        }
    }
    // Records referenced through the chain bit keep their three RVAs in the guest's copy
    // of the table.
    for record in chained {
        for field in [0, 4, 8] {
            shift_rva(host, record + field, embed_base)?;
        }
    }

    report.exception_functions_merged = functions.len();
    match host.exceptions_mut() {
        Some(existing) => existing.functions.extend(functions),
        None => {
            let mut table = ExceptionTable::new(host.machine())?;
            table.functions = functions;
            host.set_directory(DirectoryKind::Exception, Some(Directory::Exceptions(table)));
        }
    }
    Ok(())
}

/// Offsets of the RVA fields of the `UNWIND_INFO` at `rva`.
fn unwind_rva_fields(host: &PeImage, rva: u32) -> Result<Vec<u32>> {
    let header = host.read(rva, 4)?;
    let codes = (u32::from(header[2]) + 1) & !1;
    // Header, unwind codes and at most three trailing RVAs
    let full = 4 + codes * 2 + 12;
    let info = host
        .read(rva, full)
        .or_else(|_| host.read(rva, full - 8))?;
    unwind_info_rva_fields(&info)
}

fn shift_rva(host: &mut PeImage, rva: u32, delta: u32) -> Result<()> {
    let value = host.read_le::<u32>(rva)?;
    if value != 0 {
        host.write_le::<u32>(rva, value.wrapping_add(delta))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directories::{imports::ImportEntry, resources::ResourceNode},
        embed::transplant::{reserve, transplant_sections},
        test::factories::{
            guest_dll_x64, guest_dll_x86, host_exe_x64, host_exe_x86, rcdata_path,
            GUEST64_HANDLER, GUEST64_UNWIND, GUEST_ADD, GUEST_IAT, GUEST_RESOURCE,
        },
    };

    fn transplanted(host: &mut PeImage, guest: &PeImage) -> LinkMap {
        let base = reserve(host, guest).unwrap();
        transplant_sections(host, guest, base).unwrap()
    }

    fn report() -> EmbedReport {
        EmbedReport {
            guest_name: "guest.dll".into(),
            ..EmbedReport::default()
        }
    }

    #[test]
    fn imports_follow_the_guest_iat() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_imports(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.imports_merged, 1);

        let imports = host.imports().unwrap();
        assert_eq!(imports.descriptors.len(), 3);
        let merged = &imports.descriptors[2];
        assert_eq!(merged.dll_name, "KERNEL32.dll");
        assert_eq!(merged.entries, vec![ImportEntry::named("GetTickCount")]);
        assert_eq!(
            merged.first_thunk.rva(host.sections()),
            link.host_rva(GUEST_IAT)
        );

        let data = merged.first_thunk.section(host.sections()).unwrap();
        assert!(data.characteristics().contains(SectionFlags::MEM_WRITE));
    }

    #[test]
    fn exports_offset_by_host_count() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        let mut exports = ExportDirectory::new("host.exe");
        let main = exports.add_function(Some(ExportTarget::Symbol(
            host.data_ref(0x1000, 1).unwrap(),
        )));
        exports.add_name("guest_add", main);
        host.set_directory(DirectoryKind::Export, Some(Directory::Exports(exports)));

        merge_exports(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.exports_merged, 3);
        assert_eq!(report.export_collisions, vec!["guest_add".to_string()]);

        let exports = host.exports().unwrap();
        assert_eq!(exports.functions.len(), 4);
        // The host keeps its own guest_add
        assert_eq!(exports.names["guest_add"], 0);
        assert_eq!(exports.names["guest_sleep"], 3);
        assert_eq!(
            exports.by_name("guest_sleep"),
            Some(&ExportTarget::Forwarder("KERNEL32.Sleep".into()))
        );
        match exports.by_ordinal(exports.ordinal_base + 1) {
            Some(ExportTarget::Symbol(data)) => {
                assert_eq!(data.rva(host.sections()), link.host_rva(GUEST_ADD));
            }
            other => panic!("unexpected export {other:?}"),
        }
    }

    #[test]
    fn exports_created_for_plain_host() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_exports(&mut host, &guest, &link, &mut report).unwrap();
        let exports = host.exports().unwrap();
        assert_eq!(exports.dll_name, "guest.dll");
        assert!(report.export_collisions.is_empty());
        assert!(exports.by_name("guest_add").is_some());
    }

    #[test]
    fn guest_resource_replaces_host_leaf() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_resources(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.resource_collisions.len(), 1);
        assert_eq!(report.resource_collisions[0].path, rcdata_path(1));

        let root = &host.resources().unwrap().root;
        match root.lookup(&rcdata_path(1)) {
            Some(ResourceNode::Data(leaf)) => {
                assert_eq!(leaf.data.rva(host.sections()), link.host_rva(GUEST_RESOURCE));
                assert_eq!(leaf.data.read(host.sections(), 4).unwrap(), b"GST!");
            }
            other => panic!("unexpected node {other:?}"),
        }
        // Untouched host resource
        assert!(matches!(
            root.lookup(&rcdata_path(2)),
            Some(ResourceNode::Data(_))
        ));
    }

    #[test]
    fn unwind_handler_moves_once() {
        let mut host = host_exe_x64();
        let guest = guest_dll_x64();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_exception_table(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.exception_functions_merged, 2);
        assert_eq!(host.exceptions().unwrap().functions.len(), 2);

        // Both functions share one UNWIND_INFO; its handler RVA is shifted exactly once.
        let handler = host
            .read_le::<u32>(link.host_rva(GUEST64_UNWIND) + 8)
            .unwrap();
        assert_eq!(handler, link.host_rva(GUEST64_HANDLER));
    }

    #[test]
    fn x86_guest_has_no_exception_merge() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_exception_table(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.exception_functions_merged, 0);
        assert!(host.exceptions().is_none());
    }

    #[test]
    fn delay_descriptors_translated() {
        let mut host = host_exe_x86();
        let mut guest = guest_dll_x86();
        let iat = guest.data_ref(0x2040, 4).unwrap();
        let handle = guest.data_ref(0x2048, 4).unwrap();
        guest.set_directory(
            DirectoryKind::DelayImport,
            Some(Directory::DelayImports(DelayImportDirectory {
                descriptors: vec![crate::directories::delay::DelayImportDescriptor {
                    attributes: 1,
                    dll_name: "USER32.dll".into(),
                    module_handle: handle,
                    iat,
                    bound_iat: crate::image::DataRef::null(),
                    unload_iat: crate::image::DataRef::null(),
                    time_date_stamp: 0,
                    entries: vec![ImportEntry::named("MessageBoxA")],
                }],
            })),
        );
        let link = transplanted(&mut host, &guest);
        let mut report = report();

        merge_delay_imports(&mut host, &guest, &link, &mut report).unwrap();
        assert_eq!(report.delay_imports_merged, 1);
        let delay = host.delay_imports().unwrap();
        assert_eq!(delay.descriptors.len(), 2);
        let merged = &delay.descriptors[1];
        assert_eq!(merged.iat.rva(host.sections()), link.host_rva(0x2040));
        assert_eq!(merged.module_handle.rva(host.sections()), link.host_rva(0x2048));
        assert!(merged.bound_iat.is_null());
    }
}
