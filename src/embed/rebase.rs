//! Applying the guest's base relocations for its new location.
//!
//! The guest was linked for `guest_base`; its bytes now sit at `host_base + embed_base`.
//! Every relocated field therefore moves by
//! `delta = host_base + embed_base - guest_base`, computed with wrapping arithmetic so a
//! guest linked above the host works the same way.

use log::debug;

use crate::{
    directories::relocations::RelocationType,
    embed::link::LinkMap,
    image::PeImage,
    Error, Result,
};

/// Distance every absolute guest address moves.
#[must_use]
pub(crate) fn rebase_delta(host: &PeImage, guest: &PeImage, embed_base: u32) -> u64 {
    host.image_base()
        .wrapping_add(u64::from(embed_base))
        .wrapping_sub(guest.image_base())
}

/// Patch one relocated field at host `rva`.
fn apply(host: &mut PeImage, rva: u32, kind: RelocationType, delta: u64) -> Result<()> {
    match kind {
        RelocationType::HighLow => {
            let value = host.read_le::<u32>(rva)?;
            #[allow(clippy::cast_possible_truncation)]
            host.write_le::<u32>(rva, value.wrapping_add(delta as u32))
        }
        RelocationType::Dir64 => {
            let value = host.read_le::<u64>(rva)?;
            host.write_le::<u64>(rva, value.wrapping_add(delta))
        }
        RelocationType::High => {
            let value = host.read_le::<u16>(rva)?;
            #[allow(clippy::cast_possible_truncation)]
            host.write_le::<u16>(rva, value.wrapping_add((delta >> 16) as u16))
        }
        RelocationType::Low => {
            let value = host.read_le::<u16>(rva)?;
            #[allow(clippy::cast_possible_truncation)]
            host.write_le::<u16>(rva, value.wrapping_add(delta as u16))
        }
        RelocationType::Absolute => Ok(()),
        RelocationType::HighAdj(_) | RelocationType::Other(_) => {
            Err(Error::UnsupportedRelocation(kind.raw()))
        }
    }
}

/// Apply every guest relocation in the host and, if the host can itself be rebased,
/// carry the relocation over into the host's table. Returns the number applied.
///
/// # Errors
/// Returns [`Error::UnsupportedRelocation`] for `HIGHADJ` and architecture specific
/// types, and [`Error::OutOfBounds`] for a relocation outside the guest's sections.
pub(crate) fn apply_relocations(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
) -> Result<usize> {
    let Some(table) = guest.relocations() else {
        return Ok(0);
    };
    let delta = rebase_delta(host, guest, link.embed_base());
    debug!("rebasing {} guest relocations by {:#x}", table.len(), delta);

    let mut applied = Vec::with_capacity(table.len());
    for (rva, kind) in table.iter() {
        if kind == RelocationType::Absolute {
            continue;
        }
        let at = link.host_rva(rva);
        apply(host, at, kind, delta)?;
        applied.push((at, kind));
    }

    if host.is_relocatable() {
        if let Some(relocations) = host.relocations_mut() {
            for (rva, kind) in &applied {
                relocations.add(*rva, *kind);
            }
        }
    }
    Ok(applied.len())
}
