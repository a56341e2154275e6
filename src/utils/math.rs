//! Mathematical utility functions for image layout.

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An alignment of `0` or `1` leaves the value untouched. Values that would overflow
/// saturate at `u32::MAX`; image sizes are capped far below that by the allocator limit.
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }

    match value % alignment {
        0 => value,
        rem => value.saturating_add(alignment - rem),
    }
}

/// Same as [`align_up`] but on 64-bit quantities used while searching for free space.
#[must_use]
pub fn align_up_u64(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }

    match value % alignment {
        0 => value,
        rem => value.saturating_add(alignment - rem),
    }
}
