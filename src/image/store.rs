//! Arena of sections addressed by generational handles.
//!
//! The [`SectionStore`] owns every [`Section`] of an image. Sections are kept in arena
//! slots and identified by [`SectionId`]s; a separate ordering list keeps final sections
//! sorted by virtual address, followed by open sections in insertion order. Growing the
//! arena or reordering sections never invalidates an id; removing a section bumps the
//! generation of its slot so every outstanding reference resolves to `None`.
//!
//! The store also answers the two address-space questions of the image:
//!
//! - *where does this RVA live* ([`SectionStore::find_section_by_rva`]), used while
//!   parsing to turn RVAs into [`DataRef`]s, and
//! - *where is room for this many bytes* ([`SectionStore::find_section_space`]), used to
//!   reserve a range for a transplanted guest image.

use log::debug;

use crate::{
    image::{
        allocator::AddressSpaceAllocator,
        reference::{Allocation, DataRef, SectionId},
        section::Section,
    },
    utils::align_up,
    Error, Result,
};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    section: Option<Section>,
}

/// Owner of all sections of one image.
#[derive(Debug, Clone)]
pub struct SectionStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<SectionId>,
    section_alignment: u32,
    header_size: u32,
    modified: bool,
}

impl SectionStore {
    /// An empty store for an image with the given section alignment and header size.
    #[must_use]
    pub fn new(section_alignment: u32, header_size: u32) -> Self {
        SectionStore {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            section_alignment: section_alignment.max(1),
            header_size,
            modified: false,
        }
    }

    /// Section alignment used for address-space decisions.
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.section_alignment
    }

    /// Size of the header region, which is never handed out as section space.
    #[must_use]
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    pub(crate) fn set_header_size(&mut self, header_size: u32) {
        self.header_size = header_size;
    }

    /// Returns `true` once sections were added, removed, placed or moved.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Number of live sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if the store holds no section.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Section behind `id`, `None` if it was removed.
    #[must_use]
    pub fn get(&self, id: SectionId) -> Option<&Section> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.section.as_ref())
    }

    /// Mutable access to the section behind `id`.
    pub fn get_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.section.as_mut())
    }

    fn get_or_err(&self, id: SectionId) -> Result<&Section> {
        self.get(id)
            .ok_or_else(|| internal_error!("stale section id {:?}", id))
    }

    fn get_mut_or_err(&mut self, id: SectionId) -> Result<&mut Section> {
        self.get_mut(id)
            .ok_or_else(|| internal_error!("stale section id {:?}", id))
    }

    /// Ids of all sections in layout order.
    #[must_use]
    pub fn ids(&self) -> Vec<SectionId> {
        self.order.clone()
    }

    /// Iterate sections in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (SectionId, &Section)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.get(*id).map(|section| (*id, section)))
    }

    /// First section named `name` in layout order.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<SectionId> {
        self.iter()
            .find(|(_, section)| section.name() == name)
            .map(|(id, _)| id)
    }

    /// First open section named `name`.
    #[must_use]
    pub fn find_open_by_name(&self, name: &str) -> Option<SectionId> {
        self.iter()
            .find(|(_, section)| section.is_open() && section.name() == name)
            .map(|(id, _)| id)
    }

    fn insert_slot(&mut self, section: Section) -> SectionId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.section = Some(section);
            SectionId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Slot {
                generation: 0,
                section: Some(section),
            });
            SectionId {
                index,
                generation: 0,
            }
        }
    }

    /// Put `id` into the layout order: final sections sorted by address, open ones last.
    fn reorder(&mut self) {
        let mut final_ids: Vec<(u32, SectionId)> = Vec::new();
        let mut open_ids: Vec<SectionId> = Vec::new();
        for id in &self.order {
            match self.get(*id).and_then(Section::virtual_address) {
                Some(va) => final_ids.push((va, *id)),
                None => open_ids.push(*id),
            }
        }
        final_ids.sort_by_key(|(va, _)| *va);

        self.order = final_ids.into_iter().map(|(_, id)| id).collect();
        self.order.extend(open_ids);
    }

    /// Aligned `[start, end)` range a final section occupies.
    fn aligned_range(&self, section: &Section) -> Option<(u64, u64)> {
        let start = section.virtual_address()?;
        let size = align_up(section.mapped_size().max(1), self.section_alignment);
        Some((u64::from(start), u64::from(start) + u64::from(size)))
    }

    fn check_overlap(&self, candidate: &Section, ignore: Option<SectionId>) -> Result<()> {
        let Some((start, end)) = self.aligned_range(candidate) else {
            return Ok(());
        };

        if start < u64::from(self.header_size) {
            return Err(internal_error!(
                "section {} at {:#x} overlaps the headers",
                candidate.name(),
                start
            ));
        }

        for (id, section) in self.iter() {
            if Some(id) == ignore {
                continue;
            }
            if let Some((other_start, other_end)) = self.aligned_range(section) {
                if start < other_end && other_start < end {
                    return Err(internal_error!(
                        "section {} at {:#x} overlaps section {} at {:#x}",
                        candidate.name(),
                        start,
                        section.name(),
                        other_start
                    ));
                }
            }
        }
        Ok(())
    }

    /// Append a section without placement checks and return its id.
    ///
    /// Open sections go to the end of the layout order, final ones are sorted in.
    pub fn add_section(&mut self, section: Section) -> SectionId {
        let id = self.insert_slot(section);
        self.order.push(id);
        self.reorder();
        self.modified = true;
        id
    }

    /// Add a final section at the address it carries.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if the section is open or overlaps the headers or
    /// another final section.
    pub fn place_section(&mut self, section: Section) -> Result<SectionId> {
        if section.is_open() {
            return Err(internal_error!(
                "section {} has no address to be placed at",
                section.name()
            ));
        }
        self.check_overlap(&section, None)?;
        Ok(self.add_section(section))
    }

    /// Turn the open section `id` into a final one at `virtual_address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if the id is stale, the section is already final
    /// or the new range overlaps another section.
    pub fn finalize_section(&mut self, id: SectionId, virtual_address: u32) -> Result<()> {
        let mut candidate = self.get_or_err(id)?.clone();
        if !candidate.is_open() {
            return Err(internal_error!(
                "section {} is already final",
                candidate.name()
            ));
        }
        candidate.finalize(virtual_address);
        self.check_overlap(&candidate, Some(id))?;

        self.get_mut_or_err(id)?.finalize(virtual_address);
        self.reorder();
        self.modified = true;
        debug!(
            "finalized section {} at {:#x}",
            candidate.name(),
            virtual_address
        );
        Ok(())
    }

    /// Move the final section `id` to a new address. References into it follow.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if the id is stale, the section is open or the new
    /// range overlaps another section.
    pub fn move_section(&mut self, id: SectionId, virtual_address: u32) -> Result<()> {
        let mut candidate = self.get_or_err(id)?.clone();
        let Some(_) = candidate.virtual_address() else {
            return Err(internal_error!(
                "open section {} can not be moved",
                candidate.name()
            ));
        };
        let virtual_size = candidate.virtual_size();
        candidate.finalize_at(virtual_address, virtual_size);
        self.check_overlap(&candidate, Some(id))?;

        self.get_mut_or_err(id)?
            .finalize_at(virtual_address, virtual_size);
        self.reorder();
        self.modified = true;
        Ok(())
    }

    /// Remove a section. Every reference into it resolves to `None` from now on.
    pub fn remove_section(&mut self, id: SectionId) -> Option<Section> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let section = slot.section.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        self.free.push(id.index);
        self.order.retain(|other| *other != id);
        self.modified = true;
        Some(section)
    }

    /// Reserve `size` bytes aligned to `alignment` inside the open section `id`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] for stale ids or final sections and
    /// [`crate::Error::NoAddressSpace`] if the section is full.
    pub fn allocate(&mut self, id: SectionId, size: u32, alignment: u32) -> Result<Allocation> {
        let offset = self.get_mut_or_err(id)?.allocate(size, alignment)?;
        Ok(Allocation::claimed(DataRef::new(id, offset).with_size(size)))
    }

    /// Give back the space of an allocation. Unclaimed allocations and allocations in
    /// sections that are final or gone are ignored.
    pub fn release(&mut self, allocation: Allocation) {
        if !allocation.is_claimed() {
            return;
        }
        let data = allocation.data();
        if let Some(section) = data.section_id().and_then(|id| self.get_mut(id)) {
            section.release(data.offset(), data.size().unwrap_or(0));
        }
    }

    /// Allocator over the whole image, seeded with the headers and every final section.
    #[must_use]
    pub fn image_allocator(&self) -> AddressSpaceAllocator {
        let mut allocator = AddressSpaceAllocator::new();
        let headers = align_up(self.header_size.max(1), self.section_alignment);
        let _ = allocator.claim(0, headers);

        for (_, section) in self.iter() {
            if let Some((start, end)) = self.aligned_range(section) {
                let start = u32::try_from(start).unwrap_or(u32::MAX);
                let end = u32::try_from(end).unwrap_or(u32::MAX);
                // Overlapping sections in hostile input are tolerated; the claim is skipped.
                let _ = allocator.claim(start, end - start);
            }
        }
        allocator
    }

    /// Lowest section-aligned RVA with `size` free bytes, `None` if the image is full.
    #[must_use]
    pub fn find_section_space(&self, size: u32) -> Option<u32> {
        let size = align_up(size.max(1), self.section_alignment);
        self.image_allocator()
            .find_space(size, self.section_alignment)
    }

    /// End of the mapped image rounded to the section alignment (`SizeOfImage`).
    #[must_use]
    pub fn image_end(&self) -> u32 {
        let headers = align_up(self.header_size.max(1), self.section_alignment);
        self.iter()
            .filter_map(|(_, section)| self.aligned_range(section))
            .map(|(_, end)| u32::try_from(end).unwrap_or(u32::MAX))
            .fold(headers, u32::max)
    }

    /// RVA of `offset` inside section `id`; `None` for removed or open sections.
    #[must_use]
    pub fn resolve_rva(&self, id: SectionId, offset: u32) -> Option<u32> {
        self.get(id)?
            .virtual_address()
            .and_then(|va| va.checked_add(offset))
    }

    /// Find the final section holding `[rva, rva + len)` and the offset of `rva` in it.
    ///
    /// Ranges that cross a section boundary are rejected.
    #[must_use]
    pub fn find_section_by_rva(&self, rva: u32, len: u32) -> Option<(SectionId, u32)> {
        self.iter()
            .find(|(_, section)| section.contains_range(rva, len))
            .and_then(|(id, section)| Some((id, rva - section.virtual_address()?)))
    }

    /// A [`DataRef`] for `[rva, rva + len)`, `None` if no single section holds it.
    #[must_use]
    pub fn data_ref(&self, rva: u32, len: u32) -> Option<DataRef> {
        self.find_section_by_rva(rva, len)
            .map(|(id, offset)| DataRef::new(id, offset).with_size(len))
    }

    /// Place every open section, in layout order, directly after the current image end.
    ///
    /// # Errors
    /// Returns [`crate::Error::NoAddressSpace`] if the image would exceed the RVA space.
    pub fn finalize_open_sections(&mut self) -> Result<()> {
        let open: Vec<SectionId> = self
            .iter()
            .filter(|(_, section)| section.is_open())
            .map(|(id, _)| id)
            .collect();

        for id in open {
            let size = self.get_or_err(id)?.virtual_size();
            let va = self.image_end();
            if u64::from(va) + u64::from(size) > u64::from(crate::image::allocator::DEFAULT_LIMIT) {
                return Err(Error::NoAddressSpace { size });
            }
            self.finalize_section(id, va)?;
        }
        Ok(())
    }

    /// Extend virtual sizes so each final section reaches the next one.
    pub(crate) fn close_gaps(&mut self) {
        let ids = self.ids();
        for pair in ids.windows(2) {
            let (Some(current), Some(next)) = (self.get(pair[0]), self.get(pair[1])) else {
                continue;
            };
            let (Some(start), Some(next_start)) =
                (current.virtual_address(), next.virtual_address())
            else {
                continue;
            };
            let end = align_up(
                start.saturating_add(current.mapped_size()),
                self.section_alignment,
            );
            if end < next_start {
                let size = next_start - start;
                if let Some(section) = self.get_mut(pair[0]) {
                    debug!("extending section {} to close gap", section.name());
                    section.set_virtual_size(size);
                }
            }
        }
    }
}
