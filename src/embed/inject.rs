//! Resolving the host's imports of the guest DLL to the transplanted code.
//!
//! A host that imported `guest.dll!f` would still ask the loader for `guest.dll` after
//! embedding. Every import the guest's export table can answer is written into the IAT
//! slot as an absolute address (with a base relocation), and the descriptor is split so
//! the loader only sees the entries that are left.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::{
    directories::{
        exports::ExportTarget,
        imports::{dll_names_match, ImportEntry},
        DirectoryKind,
    },
    embed::report::EmbedReport,
    image::{DataRef, PeImage},
    Result,
};

/// A resolved import slot.
struct Resolution {
    /// Position of the entry in its descriptor
    index: usize,
    /// IAT slot in the host
    slot: DataRef,
    /// Address to store
    va: u64,
    by_ordinal: bool,
}

/// Resolve the host's import and delay-import slots of `guest_name` against the guest's
/// exports and split the affected descriptors.
pub(crate) fn inject_imports(
    host: &mut PeImage,
    guest: &PeImage,
    guest_name: &str,
    embed_base: u32,
    report: &mut EmbedReport,
) -> Result<()> {
    let Some(exports) = guest.exports() else {
        return Ok(());
    };
    let image_base = host.image_base();
    let resolve = |entry: &ImportEntry| -> Option<(u64, bool)> {
        let (target, by_ordinal) = match entry {
            ImportEntry::Name { name, .. } => (exports.by_name(name)?, false),
            ImportEntry::Ordinal(ordinal) => (exports.by_ordinal(u32::from(*ordinal))?, true),
        };
        // Forwarders still need the loader.
        let ExportTarget::Symbol(data) = target else {
            return None;
        };
        let rva = data.try_rva(guest.sections())?;
        let va = image_base + u64::from(embed_base) + u64::from(rva);
        Some((va, by_ordinal))
    };
    let ptr_size = host.ptr_size();

    let mut import_plan = Vec::new();
    if let Some(imports) = host.imports() {
        for (index, descriptor) in imports.descriptors.iter().enumerate() {
            if !dll_names_match(&descriptor.dll_name, guest_name) {
                continue;
            }
            let resolutions: Vec<Resolution> = descriptor
                .entries
                .iter()
                .enumerate()
                .filter_map(|(entry, import)| {
                    resolve(import).map(|(va, by_ordinal)| Resolution {
                        index: entry,
                        slot: descriptor.slot(entry, ptr_size),
                        va,
                        by_ordinal,
                    })
                })
                .collect();
            if !resolutions.is_empty() {
                import_plan.push((index, resolutions));
            }
        }
    }

    let mut delay_plan = Vec::new();
    if let Some(delay) = host.delay_imports() {
        for (index, descriptor) in delay.descriptors.iter().enumerate() {
            if !dll_names_match(&descriptor.dll_name, guest_name) {
                continue;
            }
            let resolutions: Vec<Resolution> = descriptor
                .entries
                .iter()
                .enumerate()
                .filter_map(|(entry, import)| {
                    resolve(import).map(|(va, by_ordinal)| Resolution {
                        index: entry,
                        slot: descriptor.slot(entry, ptr_size),
                        va,
                        by_ordinal,
                    })
                })
                .collect();
            if !resolutions.is_empty() {
                delay_plan.push((index, resolutions));
            }
        }
    }

    // Splitting replaces one descriptor by up to two, so later indices go first.
    for (index, resolutions) in import_plan.into_iter().rev() {
        let resolved = write_slots(host, &resolutions, report)?;
        if let Some(imports) = host.imports_mut() {
            let outcome = imports.split_descriptor(index, &resolved, ptr_size);
            debug!("import descriptor {index} of {guest_name}: {outcome:?}");
        }
    }
    for (index, resolutions) in delay_plan.into_iter().rev() {
        let resolved = write_slots(host, &resolutions, report)?;
        if let Some(delay) = host.delay_imports_mut() {
            let outcome = delay.split_descriptor(index, &resolved, ptr_size);
            debug!("delay descriptor {index} of {guest_name}: {outcome:?}");
        }
    }
    if host
        .delay_imports()
        .is_some_and(|delay| delay.descriptors.is_empty())
    {
        host.set_directory(DirectoryKind::DelayImport, None);
    }

    if report.injected() > 0 {
        info!(
            "resolved {} imports of {guest_name} ({} by name, {} by ordinal)",
            report.injected(),
            report.injected_by_name,
            report.injected_by_ordinal
        );
    }
    Ok(())
}

fn write_slots(
    host: &mut PeImage,
    resolutions: &[Resolution],
    report: &mut EmbedReport,
) -> Result<BTreeSet<usize>> {
    let mut resolved = BTreeSet::new();
    for resolution in resolutions {
        let Some(rva) = resolution.slot.try_rva(host.sections()) else {
            continue;
        };
        host.write_ptr(rva, resolution.va)?;
        host.add_pointer_relocation(rva);
        resolved.insert(resolution.index);
        if resolution.by_ordinal {
            report.injected_by_ordinal += 1;
        } else {
            report.injected_by_name += 1;
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directories::relocations::RelocationType,
        embed::transplant::{reserve, transplant_sections},
        test::factories::{
            guest_dll_x86, host_exe_x86, GUEST_ADD, GUEST_TLS_READER, HOST_BASE,
            HOST_DELAY_IAT, HOST_GUEST_IAT,
        },
    };

    #[test]
    fn resolves_names_and_ordinals() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let base = reserve(&host, &guest).unwrap();
        transplant_sections(&mut host, &guest, base).unwrap();
        let mut report = EmbedReport::default();

        inject_imports(&mut host, &guest, "GUEST.dll", base, &mut report).unwrap();
        // guest_add and #2 from the import table, guest_add again from the delay table
        assert_eq!(report.injected_by_name, 2);
        assert_eq!(report.injected_by_ordinal, 1);

        let add_va = HOST_BASE + u64::from(base + GUEST_ADD);
        let reader_va = HOST_BASE + u64::from(base + GUEST_TLS_READER);
        assert_eq!(
            u64::from(host.read_le::<u32>(HOST_GUEST_IAT).unwrap()),
            add_va
        );
        assert_eq!(
            u64::from(host.read_le::<u32>(HOST_GUEST_IAT + 4).unwrap()),
            reader_va
        );
        assert_eq!(
            u64::from(host.read_le::<u32>(HOST_DELAY_IAT).unwrap()),
            add_va
        );
        let relocations = host.relocations().unwrap();
        assert_eq!(relocations.get(HOST_GUEST_IAT), Some(RelocationType::HighLow));
        assert_eq!(relocations.get(HOST_DELAY_IAT), Some(RelocationType::HighLow));

        // guest_missing stays, two pointer widths into the old thunk array
        let imports = host.imports().unwrap();
        assert_eq!(imports.descriptors.len(), 2);
        let rest = &imports.descriptors[1];
        assert_eq!(rest.entries, vec![ImportEntry::named("guest_missing")]);
        assert_eq!(rest.first_thunk.rva(host.sections()), HOST_GUEST_IAT + 8);

        // The only delay descriptor is gone, and with it the directory
        assert!(host.delay_imports().is_none());
    }

    #[test]
    fn other_dlls_untouched() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let base = reserve(&host, &guest).unwrap();
        transplant_sections(&mut host, &guest, base).unwrap();
        let mut report = EmbedReport::default();

        inject_imports(&mut host, &guest, "other.dll", base, &mut report).unwrap();
        assert_eq!(report.injected(), 0);
        assert_eq!(host.imports().unwrap().descriptors.len(), 2);
        assert_eq!(host.delay_imports().unwrap().descriptors.len(), 1);
    }
}
