//! Guest section → host section correspondence.

use std::collections::HashMap;

use crate::image::{DataRef, SectionId};

/// Maps every guest section to its transplanted copy in the host.
///
/// Guest directories are cloned and then translated through the map, so a guest
/// [`DataRef`] keeps its offset and declared size and only changes section.
#[derive(Debug, Clone, Default)]
pub struct LinkMap {
    sections: HashMap<SectionId, SectionId>,
    embed_base: u32,
}

impl LinkMap {
    /// An empty map for a guest transplanted at `embed_base`.
    #[must_use]
    pub fn new(embed_base: u32) -> Self {
        LinkMap {
            sections: HashMap::new(),
            embed_base,
        }
    }

    /// Record that guest section `guest` now lives in host section `host`.
    pub fn insert(&mut self, guest: SectionId, host: SectionId) {
        self.sections.insert(guest, host);
    }

    /// RVA in the host where the guest image starts.
    #[must_use]
    pub fn embed_base(&self) -> u32 {
        self.embed_base
    }

    /// Host section holding the copy of `guest`.
    #[must_use]
    pub fn host_section(&self, guest: SectionId) -> Option<SectionId> {
        self.sections.get(&guest).copied()
    }

    /// Host RVA of a guest RVA.
    #[must_use]
    pub fn host_rva(&self, guest_rva: u32) -> u32 {
        self.embed_base.wrapping_add(guest_rva)
    }

    /// The same location in the host. Null, and references into sections that were not
    /// transplanted, translate to null.
    #[must_use]
    pub fn translate(&self, data: DataRef) -> DataRef {
        let Some(host) = data.section_id().and_then(|id| self.host_section(id)) else {
            return DataRef::null();
        };
        let translated = DataRef::new(host, data.offset());
        match data.size() {
            Some(size) => translated.with_size(size),
            None => translated,
        }
    }

    /// Number of mapped sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns `true` if no section is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Section, SectionFlags, SectionStore};

    #[test]
    fn translate_keeps_offset_and_size() {
        let mut guest = SectionStore::new(0x1000, 0x400);
        let mut host = SectionStore::new(0x1000, 0x400);
        let g = guest
            .place_section(Section::with_address(
                ".text",
                SectionFlags::CODE,
                0x1000,
                0x100,
                vec![0; 0x100],
            ))
            .unwrap();
        let h = host
            .place_section(Section::with_address(
                ".text",
                SectionFlags::CODE,
                0x9000,
                0x100,
                vec![0; 0x100],
            ))
            .unwrap();

        let mut map = LinkMap::new(0x8000);
        map.insert(g, h);

        let translated = map.translate(DataRef::new(g, 0x10).with_size(4));
        assert_eq!(translated.rva(&host), 0x9010);
        assert_eq!(translated.size(), Some(4));
        assert_eq!(map.host_rva(0x1010), 0x9010);

        assert!(map.translate(DataRef::null()).is_null());
        assert!(LinkMap::new(0).translate(DataRef::new(g, 0)).is_null());
    }
}
