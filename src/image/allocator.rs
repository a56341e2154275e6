//! Collision-free interval allocator over the 32-bit RVA space.
//!
//! [`AddressSpaceAllocator`] tracks claimed `[offset, offset + size)` ranges and answers
//! "where is the lowest aligned gap of this size". It is used at two levels:
//!
//! - inside every *open* section, to hand out offsets for directory data that is still
//!   being assembled (and to punch holes again when a directory is invalidated), and
//! - over the whole image, seeded with the header region and every final section, to
//!   reserve address space for a transplanted guest or for a freshly placed section.
//!
//! Claims are kept sorted and coalesced, so adjacent claims merge into one interval and
//! a later [`AddressSpaceAllocator::release`] can remove any sub-range of them.

use std::collections::BTreeMap;

use crate::{utils::align_up_u64, Result};

/// Highest offset (exclusive) an allocator hands out by default: 2 GiB, the largest
/// image size the Windows loader accepts.
pub const DEFAULT_LIMIT: u32 = 0x8000_0000;

/// A set of claimed, non-overlapping intervals below a fixed limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpaceAllocator {
    /// start -> end (exclusive), non-overlapping, non-adjacent
    claims: BTreeMap<u32, u32>,
    limit: u32,
}

impl Default for AddressSpaceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaceAllocator {
    /// An empty allocator limited to [`DEFAULT_LIMIT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }

    /// An empty allocator that never hands out space at or above `limit`.
    #[must_use]
    pub fn with_limit(limit: u32) -> Self {
        AddressSpaceAllocator {
            claims: BTreeMap::new(),
            limit,
        }
    }

    /// The exclusive upper bound of this allocator.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Returns `true` if nothing is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Iterate claimed intervals as `(offset, size)` in ascending order.
    pub fn claims(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.claims.iter().map(|(start, end)| (*start, end - start))
    }

    /// Returns `true` if no byte of `[offset, offset + size)` is claimed.
    #[must_use]
    pub fn is_free(&self, offset: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        let end = u64::from(offset) + u64::from(size);

        // The only claim that can overlap is the last one starting before `end`.
        self.claims
            .range(..=u32::try_from(end - 1).unwrap_or(u32::MAX))
            .next_back()
            .map_or(true, |(_, claim_end)| *claim_end <= offset)
    }

    /// Claim `[offset, offset + size)`.
    ///
    /// Zero-sized claims are accepted and ignored.
    ///
    /// # Errors
    /// Returns [`crate::Error::Internal`] if the range overlaps an existing claim or
    /// exceeds the allocator limit. Callers are expected to find space first.
    pub fn claim(&mut self, offset: u32, size: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.limit)
            .ok_or_else(|| {
                internal_error!(
                    "claim {:#x}+{:#x} exceeds limit {:#x}",
                    offset,
                    size,
                    self.limit
                )
            })?;

        if !self.is_free(offset, size) {
            return Err(internal_error!(
                "claim {:#x}..{:#x} overlaps an existing claim",
                offset,
                end
            ));
        }

        let mut start = offset;
        let mut end = end;

        // Merge with a predecessor ending exactly at `offset`.
        if let Some((&prev_start, &prev_end)) = self.claims.range(..offset).next_back() {
            if prev_end == offset {
                self.claims.remove(&prev_start);
                start = prev_start;
            }
        }

        // Merge with a successor starting exactly at `end`.
        if let Some(next_end) = self.claims.remove(&end) {
            end = next_end;
        }

        self.claims.insert(start, end);
        Ok(())
    }

    /// Release every claimed byte inside `[offset, offset + size)`, splitting claims that
    /// only partially overlap the range.
    pub fn release(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        let end = offset.saturating_add(size);

        let overlapping: Vec<(u32, u32)> = self
            .claims
            .range(..end)
            .filter(|(_, claim_end)| **claim_end > offset)
            .map(|(start, claim_end)| (*start, *claim_end))
            .collect();

        for (claim_start, claim_end) in overlapping {
            self.claims.remove(&claim_start);
            if claim_start < offset {
                self.claims.insert(claim_start, offset);
            }
            if claim_end > end {
                self.claims.insert(end, claim_end);
            }
        }
    }

    /// Lowest offset that is a multiple of `alignment` and has `size` free bytes below the
    /// limit, or `None` if no such gap exists.
    #[must_use]
    pub fn find_space(&self, size: u32, alignment: u32) -> Option<u32> {
        let alignment = u64::from(alignment.max(1));
        let size = u64::from(size);
        let limit = u64::from(self.limit);

        let mut candidate = 0_u64;
        for (&start, &end) in &self.claims {
            let aligned = align_up_u64(candidate, alignment);
            if aligned + size <= u64::from(start) {
                return u32::try_from(aligned).ok();
            }
            candidate = candidate.max(u64::from(end));
        }

        let aligned = align_up_u64(candidate, alignment);
        if aligned + size <= limit {
            u32::try_from(aligned).ok()
        } else {
            None
        }
    }

    /// Highest claimed end, rounded up to `alignment`; `0` when nothing is claimed.
    #[must_use]
    pub fn span_size(&self, alignment: u32) -> u32 {
        self.claims.values().next_back().map_or(0, |end| {
            u32::try_from(align_up_u64(u64::from(*end), u64::from(alignment.max(1))))
                .unwrap_or(u32::MAX)
        })
    }
}
