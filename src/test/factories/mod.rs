//! Factory methods for test images and directory parse contexts.

mod images;

pub use images::*;

use crate::image::{Section, SectionFlags, SectionStore};

/// A store whose only section, at RVA `0x1000`, holds `bytes`; returns the store and the
/// RVA of the first byte.
pub fn parse_context_over(bytes: &[u8]) -> (SectionStore, u32) {
    let mut store = SectionStore::new(0x1000, 0x400);
    let size = u32::try_from(bytes.len()).unwrap().max(1);
    store
        .place_section(Section::with_address(
            ".data",
            SectionFlags::DATA,
            0x1000,
            size,
            bytes.to_vec(),
        ))
        .unwrap();
    (store, 0x1000)
}
