//! Static TLS support for the transplanted guest.
//!
//! The loader only sets up the TLS block of the main executable, so a guest that reads
//! its block through `fs:[0x2C]` (the TEB's `ThreadLocalStoragePointer`) would read the
//! host's table. On x86 the known encodings of that load are rewritten to load the
//! address of a private one-entry table instead, and the trampoline stores index 0 into
//! the guest's `_tls_index`. All threads share the block afterwards.
//!
//! x64 code reaches the TEB through `gs:[0x58]` with RIP-relative index loads that are
//! not rewritten; there the trampoline allocates a real index instead.

use log::{debug, warn};

use crate::{
    directories::tls::TlsDirectory,
    embed::link::LinkMap,
    image::{PeImage, SectionFlags},
    Result,
};

/// `KERNEL32.dll` functions the x64 trampoline needs to allocate a TLS index.
pub(crate) const TLS_HELPERS: [&str; 2] = ["TlsAlloc", "TlsSetValue"];

/// `fs:` segment override prefix.
const FS_PREFIX: u8 = 0x64;
/// Displacement of `ThreadLocalStoragePointer` in the x86 TEB.
const TEB_TLS_POINTER: [u8; 4] = [0x2C, 0x00, 0x00, 0x00];

/// `mov eax, fs:[0x2C]` (`64 A1 2C 00 00 00`).
const MOV_EAX_MOFFS: u8 = 0xA1;
/// `mov r32, r/m32`.
const MOV_R32_RM32: u8 = 0x8B;
/// ModRM bytes of `mov r32, [disp32]` for `ecx`, `edx`, `ebx`, `esi` and `edi`.
const DISP32_MODRM: [u8; 5] = [0x0D, 0x15, 0x1D, 0x35, 0x3D];
/// `mov r32, imm32` opcode base.
const MOV_R32_IMM32: u8 = 0xB8;
const NOP: u8 = 0x90;

/// The guest's TLS block as the trampoline should install it: the template as it now
/// reads in the host (relocations already applied) followed by the zero fill.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the template is not inside a transplanted
/// section.
pub(crate) fn template_copy(host: &PeImage, link: &LinkMap, tls: &TlsDirectory) -> Result<Vec<u8>> {
    let size = tls.template_size();
    let mut block = if size == 0 {
        Vec::new()
    } else {
        let rva = link
            .translate(tls.raw_data)
            .try_rva(host.sections())
            .ok_or(crate::Error::OutOfBounds)?;
        host.read(rva, size)?
    };
    block.resize(block.len() + tls.size_of_zero_fill as usize, 0);
    Ok(block)
}

/// One rewritten load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Patch {
    /// Offset of the `fs:` prefix
    offset: usize,
    /// Destination register number (`eax` = 0)
    register: u8,
    /// Length of the original instruction
    len: usize,
}

/// Find every known `mov r32, fs:[0x2C]` encoding in `code`.
fn find_tls_loads(code: &[u8]) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut offset = 0;
    while offset + 6 <= code.len() {
        if code[offset] != FS_PREFIX {
            offset += 1;
            continue;
        }
        let opcode = code[offset + 1];
        if opcode == MOV_EAX_MOFFS && code[offset + 2..offset + 6] == TEB_TLS_POINTER {
            patches.push(Patch {
                offset,
                register: 0,
                len: 6,
            });
            offset += 6;
            continue;
        }
        if opcode == MOV_R32_RM32
            && offset + 7 <= code.len()
            && DISP32_MODRM.contains(&code[offset + 2])
            && code[offset + 3..offset + 7] == TEB_TLS_POINTER
        {
            patches.push(Patch {
                offset,
                register: (code[offset + 2] >> 3) & 7,
                len: 7,
            });
            offset += 7;
            continue;
        }
        offset += 1;
    }
    patches
}

/// Rewrite the TEB loads in the guest's executable sections to `mov r32, table_va`,
/// NOP-padded to the original length, and relocate the new immediates. Returns the
/// number of rewritten instructions; always 0 for x64 guests.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `table_va` does not fit 32 bits.
pub(crate) fn patch_fs_accesses(
    host: &mut PeImage,
    guest: &PeImage,
    link: &LinkMap,
    table_va: u64,
) -> Result<usize> {
    if guest.is_pe32_plus() {
        warn!("static TLS of x64 guests is not patched; accesses through gs:[0x58] keep the host's block");
        return Ok(0);
    }
    let immediate = u32::try_from(table_va).map_err(|_| crate::Error::OutOfBounds)?;

    let mut relocations = Vec::new();
    for (guest_id, section) in guest.sections().iter() {
        if !section.characteristics().contains(SectionFlags::MEM_EXECUTE) {
            continue;
        }
        let Some(host_id) = link.host_section(guest_id) else {
            continue;
        };
        let Some(target) = host.sections_mut().get_mut(host_id) else {
            continue;
        };
        let Some(base) = target.virtual_address() else {
            continue;
        };

        let code = target.data_mut();
        for patch in find_tls_loads(code) {
            let slot = &mut code[patch.offset..patch.offset + patch.len];
            slot[0] = MOV_R32_IMM32 + patch.register;
            slot[1..5].copy_from_slice(&immediate.to_le_bytes());
            slot[5..].fill(NOP);
            debug!(
                "patched fs:[0x2C] load at {:#x}",
                base as usize + patch.offset
            );
            #[allow(clippy::cast_possible_truncation)]
            relocations.push(base + patch.offset as u32 + 1);
        }
    }

    for rva in &relocations {
        host.add_pointer_relocation(*rva);
    }
    Ok(relocations.len())
}
