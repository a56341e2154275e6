//! Handles into the section arena.
//!
//! Directories never store raw RVAs. They store a [`DataRef`]: the [`SectionId`] of the
//! section that holds the data plus a section-relative offset. Because the offset is
//! relative, placing, finalizing or moving a section never requires rewriting a
//! reference, and because a [`SectionId`] carries the generation of its arena slot, a
//! reference into a removed section resolves to `None` (and to RVA `0`) instead of
//! silently pointing at whatever section reuses the slot.
//!
//! # Key Components
//!
//! - [`SectionId`] - generational index of a section in the [`crate::image::SectionStore`]
//! - [`SectionRef`] - nullable handle to a section
//! - [`DataRef`] - section handle + offset + optional declared size
//! - [`Allocation`] - a [`DataRef`] that owns a claim inside an open section

use crate::image::{section::Section, store::SectionStore};

/// Stable identity of a section inside a [`SectionStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SectionId {
    /// Arena slot of this section.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the arena slot this id was issued for.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A weak, nullable handle to a section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SectionRef(Option<SectionId>);

impl SectionRef {
    /// A handle to `id`.
    #[must_use]
    pub fn new(id: SectionId) -> Self {
        SectionRef(Some(id))
    }

    /// A handle that refers to nothing.
    #[must_use]
    pub fn null() -> Self {
        SectionRef(None)
    }

    /// The referenced id, `None` for a null handle.
    #[must_use]
    pub fn id(&self) -> Option<SectionId> {
        self.0
    }

    /// Returns `true` for a null handle.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// The referenced section, `None` if null or removed.
    #[must_use]
    pub fn get<'a>(&self, store: &'a SectionStore) -> Option<&'a Section> {
        self.0.and_then(|id| store.get(id))
    }

    /// RVA of the referenced section, `0` if null, removed or not yet placed.
    #[must_use]
    pub fn rva(&self, store: &SectionStore) -> u32 {
        self.get(store)
            .and_then(Section::virtual_address)
            .unwrap_or(0)
    }
}

impl From<SectionId> for SectionRef {
    fn from(id: SectionId) -> Self {
        SectionRef::new(id)
    }
}

/// A section-relative location of some data, optionally with a declared size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DataRef {
    section: SectionRef,
    offset: u32,
    size: Option<u32>,
}

impl DataRef {
    /// Reference `offset` bytes into section `id`.
    #[must_use]
    pub fn new(id: SectionId, offset: u32) -> Self {
        DataRef {
            section: SectionRef::new(id),
            offset,
            size: None,
        }
    }

    /// A reference to nothing. Its RVA is `0`.
    #[must_use]
    pub fn null() -> Self {
        DataRef::default()
    }

    /// The same location with a declared size.
    #[must_use]
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// The location `delta` bytes further into the same section. Null stays null.
    #[must_use]
    pub fn offset_by(mut self, delta: u32) -> Self {
        if !self.is_null() {
            self.offset = self.offset.wrapping_add(delta);
        }
        self
    }

    /// Returns `true` if this reference has no section.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.section.is_null()
    }

    /// Handle of the referenced section.
    #[must_use]
    pub fn section_ref(&self) -> SectionRef {
        self.section
    }

    /// Id of the referenced section.
    #[must_use]
    pub fn section_id(&self) -> Option<SectionId> {
        self.section.id()
    }

    /// Section-relative offset.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Declared size, if any.
    #[must_use]
    pub fn size(&self) -> Option<u32> {
        self.size
    }

    /// The referenced section, `None` if null or removed.
    #[must_use]
    pub fn section<'a>(&self, store: &'a SectionStore) -> Option<&'a Section> {
        self.section.get(store)
    }

    /// RVA of the referenced byte, or `None` if the section is gone or still open.
    #[must_use]
    pub fn try_rva(&self, store: &SectionStore) -> Option<u32> {
        self.section(store)?
            .virtual_address()
            .map(|va| va.wrapping_add(self.offset))
    }

    /// RVA of the referenced byte; `0` when it can not be resolved.
    #[must_use]
    pub fn rva(&self, store: &SectionStore) -> u32 {
        self.try_rva(store).unwrap_or(0)
    }

    /// Read `len` bytes at this location.
    #[must_use]
    pub fn read(&self, store: &SectionStore, len: u32) -> Option<Vec<u8>> {
        self.section(store)?.read(self.offset, len).ok()
    }

    /// Read the declared size worth of bytes, `None` without a declared size.
    #[must_use]
    pub fn read_sized(&self, store: &SectionStore) -> Option<Vec<u8>> {
        self.read(store, self.size?)
    }
}

/// A reference that owns space inside an open section.
///
/// The claim is returned with [`SectionStore::release`]. Allocations made in a section
/// that was finalized since are still released without effect, the bytes simply stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    data: DataRef,
    claimed: bool,
}

impl Allocation {
    pub(crate) fn claimed(data: DataRef) -> Self {
        Allocation {
            data,
            claimed: true,
        }
    }

    /// Wrap a location that was not obtained from an allocator, e.g. a directory read
    /// from a file. Releasing it does nothing.
    #[must_use]
    pub fn unclaimed(data: DataRef) -> Self {
        Allocation {
            data,
            claimed: false,
        }
    }

    /// The allocated location.
    #[must_use]
    pub fn data(&self) -> DataRef {
        self.data
    }

    /// Returns `true` if this allocation owns allocator space.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}
