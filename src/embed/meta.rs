//! The `.meta` section: data the trampoline and the patched guest code need at run time.
//!
//! Layout, each part present only when requested:
//!
//! ```text
//! +0            helper IAT (KERNEL32.dll imports, null terminated)
//! +align(ptr)   TLS pointer table: one slot holding the VA of the block copy (x86)
//! +align(16)    TLS block copy: template bytes followed by the zero fill
//! ```

use log::debug;

use crate::{
    directories::{
        imports::{ImportDescriptor, ImportDirectory, ImportEntry},
        Directory, DirectoryKind,
    },
    image::{DataRef, PeImage, Section, SectionFlags},
    utils::align_up,
    Error, Result,
};

/// DLL the helper functions are imported from.
pub(crate) const HELPER_DLL: &str = "KERNEL32.dll";

/// What goes into the section.
#[derive(Debug, Default)]
pub(crate) struct MetaRequest {
    /// `KERNEL32.dll` functions the trampoline calls through an IAT slot
    pub helpers: Vec<&'static str>,
    /// Emit a one-entry TLS pointer table pointing at the block copy
    pub pointer_table: bool,
    /// Initial contents of the private TLS block
    pub block: Option<Vec<u8>>,
}

impl MetaRequest {
    fn is_empty(&self) -> bool {
        self.helpers.is_empty() && self.block.is_none()
    }
}

/// Where things ended up, as RVAs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MetaBlock {
    /// RVA of the section
    pub rva: u32,
    /// Helper name and RVA of its IAT slot
    pub helpers: Vec<(&'static str, u32)>,
    /// RVA of the TLS pointer table
    pub pointer_table: Option<u32>,
    /// RVA of the TLS block copy
    pub block: Option<u32>,
}

impl MetaBlock {
    /// RVA of the IAT slot of `helper`.
    pub fn helper(&self, helper: &str) -> Option<u32> {
        self.helpers
            .iter()
            .find(|(name, _)| *name == helper)
            .map(|(_, rva)| *rva)
    }
}

/// Place a final `.meta` section holding everything in `request`, import the helpers
/// through it and relocate the pointer table. `None` if nothing was requested.
///
/// # Errors
/// Returns [`Error::NoAddressSpace`] if the host has no room for the section.
pub(crate) fn build_meta(
    host: &mut PeImage,
    name: &str,
    request: MetaRequest,
) -> Result<Option<MetaBlock>> {
    if request.is_empty() {
        return Ok(None);
    }
    let ptr = host.ptr_size();
    let helper_count = u32::try_from(request.helpers.len()).map_err(|_| Error::OutOfBounds)?;

    let mut size = if helper_count == 0 {
        0
    } else {
        (helper_count + 1) * ptr
    };
    let table_offset = if request.pointer_table && request.block.is_some() {
        let offset = align_up(size, ptr);
        size = offset + ptr;
        Some(offset)
    } else {
        None
    };
    let block_offset = match &request.block {
        Some(block) => {
            let offset = align_up(size, 16);
            let len = u32::try_from(block.len()).map_err(|_| Error::OutOfBounds)?;
            size = offset + len;
            Some(offset)
        }
        None => None,
    };
    let size = size.max(ptr);

    let rva = host
        .sections()
        .find_section_space(size)
        .ok_or(Error::NoAddressSpace { size })?;

    let mut bytes = vec![0u8; size as usize];
    if let (Some(offset), Some(block)) = (block_offset, &request.block) {
        let start = offset as usize;
        bytes[start..start + block.len()].copy_from_slice(block);
    }
    let id = host.sections_mut().place_section(Section::with_address(
        name,
        SectionFlags::DATA,
        rva,
        size,
        bytes,
    ))?;

    let mut meta = MetaBlock {
        rva,
        ..MetaBlock::default()
    };

    if let (Some(table), Some(block)) = (table_offset, block_offset) {
        let block_va = host.image_base() + u64::from(rva + block);
        host.write_ptr(rva + table, block_va)?;
        host.add_pointer_relocation(rva + table);
        meta.pointer_table = Some(rva + table);
    }
    meta.block = block_offset.map(|offset| rva + offset);

    if helper_count > 0 {
        let mut slot = rva;
        for helper in &request.helpers {
            meta.helpers.push((*helper, slot));
            slot += ptr;
        }
        let entries = request
            .helpers
            .iter()
            .map(|helper| ImportEntry::named(helper))
            .collect();
        let descriptor = ImportDescriptor::new(
            HELPER_DLL,
            entries,
            DataRef::new(id, 0).with_size(helper_count * ptr),
        );
        match host.imports_mut() {
            Some(imports) => imports.descriptors.push(descriptor),
            None => host.set_directory(
                DirectoryKind::Import,
                Some(Directory::Imports(ImportDirectory {
                    descriptors: vec![descriptor],
                })),
            ),
        }
    }

    debug!(
        "placed {name} at {rva:#x} ({size:#x} bytes, {} helpers)",
        meta.helpers.len()
    );
    Ok(Some(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        directories::relocations::RelocationType,
        test::factories::{host_exe_x64, host_exe_x86, HOST_BASE},
    };

    #[test]
    fn empty_request_places_nothing() {
        let mut host = host_exe_x86();
        let sections = host.sections().len();
        assert!(build_meta(&mut host, ".meta", MetaRequest::default())
            .unwrap()
            .is_none());
        assert_eq!(host.sections().len(), sections);
    }

    #[test]
    fn x86_table_points_at_block() {
        let mut host = host_exe_x86();
        let request = MetaRequest {
            helpers: vec!["VirtualProtect"],
            pointer_table: true,
            block: Some(b"TLSDATA!\0\0\0\0".to_vec()),
        };
        let meta = build_meta(&mut host, ".meta", request).unwrap().unwrap();

        // helper slot + terminator, then the table, then the 16-aligned block
        assert_eq!(meta.helper("VirtualProtect"), Some(meta.rva));
        assert_eq!(meta.pointer_table, Some(meta.rva + 8));
        assert_eq!(meta.block, Some(meta.rva + 16));

        let table = host.read_le::<u32>(meta.rva + 8).unwrap();
        assert_eq!(u64::from(table), HOST_BASE + u64::from(meta.rva + 16));
        assert_eq!(host.read(meta.rva + 16, 8).unwrap(), b"TLSDATA!");
        assert_eq!(
            host.relocations().unwrap().get(meta.rva + 8),
            Some(RelocationType::HighLow)
        );

        let imports = host.imports().unwrap();
        let helper = imports.descriptors.last().unwrap();
        assert_eq!(helper.dll_name, HELPER_DLL);
        assert_eq!(helper.first_thunk.rva(host.sections()), meta.rva);
    }

    #[test]
    fn x64_helpers_without_table() {
        let mut host = host_exe_x64();
        let request = MetaRequest {
            helpers: vec!["TlsAlloc", "TlsSetValue"],
            pointer_table: false,
            block: Some(vec![0xAB; 4]),
        };
        let meta = build_meta(&mut host, ".meta", request).unwrap().unwrap();
        assert_eq!(meta.helper("TlsSetValue"), Some(meta.rva + 8));
        assert_eq!(meta.pointer_table, None);
        assert_eq!(meta.block, Some(meta.rva + 32));

        let id = host.sections().find_by_name(".meta").unwrap();
        let section = host.sections().get(id).unwrap();
        assert!(section.characteristics().contains(SectionFlags::MEM_WRITE));
    }
}
