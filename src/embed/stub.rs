//! Placing the entry trampoline.

use log::debug;

use crate::{
    codegen::{assemble_trampoline, embed_blob, Placement, TrampolinePlan},
    image::PeImage,
    Error, Result,
};

/// Slack for the stub growing when reassembled at its final address.
const SIZE_SLACK: u32 = 16;

/// Assemble `plan`, place it as section `name` and return the RVA of its entry.
///
/// Relative branches may encode differently depending on the address the stub is
/// assembled for, so it is assembled once to measure it and again at its final RVA.
///
/// # Errors
/// Returns [`Error::NoAddressSpace`] if the host has no room for the stub and
/// [`Error::Codegen`] if the assembler rejects the plan.
pub(crate) fn place_trampoline(
    host: &mut PeImage,
    name: &str,
    mut plan: TrampolinePlan,
) -> Result<u32> {
    let image_base = host.image_base();

    plan.base_va = image_base + u64::from(host.sections().image_end());
    let measured = assemble_trampoline(&plan)?;
    let size = measured.size() + SIZE_SLACK;

    let rva = host
        .sections()
        .find_section_space(size)
        .ok_or(Error::NoAddressSpace { size })?;
    plan.base_va = image_base + u64::from(rva);
    let blob = assemble_trampoline(&plan)?;
    if blob.size() > size {
        return Err(internal_error!(
            "trampoline grew from {:#x} to {:#x} bytes",
            measured.size(),
            blob.size()
        ));
    }

    let entry = embed_blob(
        host,
        &blob,
        &Placement {
            name: name.to_string(),
            rva,
        },
    )?;
    debug!(
        "trampoline at {rva:#x} ({:#x} bytes, {} fixups), entry {entry:#x}",
        blob.size(),
        blob.fixups.len()
    );
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::factories::{host_exe_x64, host_exe_x86, HOST_BASE, HOST_ENTRY};

    #[test]
    fn stub_lands_after_the_image() {
        let mut host = host_exe_x86();
        let end = host.sections().image_end();
        let plan = TrampolinePlan::new(32, 0, HOST_BASE + u64::from(HOST_ENTRY));

        let entry = place_trampoline(&mut host, ".stub", plan).unwrap();
        assert_eq!(entry, end);
        let id = host.sections().find_by_name(".stub").unwrap();
        assert_eq!(
            host.sections().get(id).unwrap().virtual_address(),
            Some(end)
        );
        // a lone jmp back to the host entry
        assert_eq!(host.read(entry, 1).unwrap(), vec![0xE9]);
    }

    #[test]
    fn x64_stub_keeps_relocations_consistent() {
        let mut host = host_exe_x64();
        let relocations = host.relocations().unwrap().len();
        let plan = TrampolinePlan::new(64, 0, host.image_base() + u64::from(HOST_ENTRY));
        place_trampoline(&mut host, ".stub", plan).unwrap();
        // no absolute addresses in a bare stub
        assert_eq!(host.relocations().unwrap().len(), relocations);
    }
}
