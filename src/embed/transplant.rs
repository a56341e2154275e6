//! Address space reservation and section copying.

use log::debug;

use crate::{
    embed::link::LinkMap,
    image::{PeImage, Section},
    Error, Result,
};

/// Lowest host RVA with room for the whole guest image.
///
/// # Errors
/// Returns [`Error::NotSupported`] if the guest's section alignment is not a multiple of
/// the host's, and [`Error::NoAddressSpace`] if the host has no gap of `SizeOfImage` bytes.
pub(crate) fn reserve(host: &PeImage, guest: &PeImage) -> Result<u32> {
    let host_alignment = host.sections().section_alignment();
    let guest_alignment = guest.sections().section_alignment();
    if host_alignment == 0 || guest_alignment % host_alignment != 0 {
        return Err(Error::NotSupported);
    }

    let size = guest.size_of_image();
    host.sections()
        .find_section_space(size)
        .ok_or(Error::NoAddressSpace { size })
}

/// Copy every guest section to `embed_base + VirtualAddress` in the host.
///
/// # Errors
/// Returns [`Error::Internal`] if a guest section is still open or a copy overlaps a
/// host section.
pub(crate) fn transplant_sections(
    host: &mut PeImage,
    guest: &PeImage,
    embed_base: u32,
) -> Result<LinkMap> {
    let mut link = LinkMap::new(embed_base);

    for (guest_id, section) in guest.sections().iter() {
        let Some(virtual_address) = section.virtual_address() else {
            return Err(internal_error!(
                "guest section {} has no address",
                section.name()
            ));
        };
        let mapped = section.mapped_size();
        let mut data = section.data().to_vec();
        data.truncate(mapped as usize);

        let target = embed_base
            .checked_add(virtual_address)
            .ok_or(Error::NoAddressSpace { size: mapped })?;
        let host_id = host.sections_mut().place_section(Section::with_address(
            &section.name(),
            section.characteristics(),
            target,
            mapped,
            data,
        ))?;
        debug!(
            "transplanted {} {:#x} -> {:#x} ({:#x} bytes)",
            section.name(),
            virtual_address,
            target,
            mapped
        );
        link.insert(guest_id, host_id);
    }
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::factories::{guest_dll_x86, host_exe_x86};

    #[test]
    fn guest_lands_after_host() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        let host_end = host.sections().image_end();

        let base = reserve(&host, &guest).unwrap();
        assert_eq!(base, host_end);

        let link = transplant_sections(&mut host, &guest, base).unwrap();
        assert_eq!(link.len(), guest.sections().len());
        assert_eq!(host.sections().image_end(), base + guest.size_of_image());

        // Section contents follow their RVA
        let text = host.read(base + 0x1000, 8).unwrap();
        assert_eq!(text, guest.read(0x1000, 8).unwrap());
    }

    #[test]
    fn overlapping_target_is_rejected() {
        let mut host = host_exe_x86();
        let guest = guest_dll_x86();
        assert!(matches!(
            transplant_sections(&mut host, &guest, 0),
            Err(Error::Internal { .. })
        ));
    }
}
