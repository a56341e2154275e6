//! Low-level byte order and safe reading/writing utilities for PE structures.
//!
//! Every on-disk PE structure is little-endian. This module provides bounds-checked reads
//! and writes of primitive integers from and to byte buffers, plus the pointer-width aware
//! variants needed because PE32 stores 4-byte and PE32+ stores 8-byte virtual addresses
//! in otherwise identical tables (thunks, TLS directories, callback arrays).
//!
//! # Key Components
//!
//! - [`crate::file::io::PeIO`] - Trait defining endian-aware conversion for primitive types
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Reads with optional auto-advance
//! - [`crate::file::io::read_le_at_dyn`] - Reads a 4- or 8-byte pointer sized value
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Writes with optional auto-advance
//! - [`crate::file::io::write_le_at_dyn`] - Writes a 4- or 8-byte pointer sized value
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use peweld::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x5A4Du16)?;
//! write_le_at(&mut data, &mut offset, 0x80u32)?;
//!
//! offset = 0;
//! let magic: u16 = read_le_at(&data, &mut offset)?;
//! assert_eq!(magic, 0x5A4D);
//! # Ok::<(), peweld::Error>(())
//! ```
//!
//! All functions return [`crate::Error::OutOfBounds`] instead of panicking when the buffer is
//! too short, so truncated or hostile input surfaces as an error.

use crate::{Error::OutOfBounds, Result};

/// Trait for implementing type-specific safe binary data reading operations.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait PeIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pe_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl PeIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_pe_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: PeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes read.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: PeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Reads a pointer sized value: 8 bytes when `is_wide` (PE32+), 4 bytes otherwise.
///
/// 4-byte values are zero-extended to `u64`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at_dyn(data: &[u8], offset: &mut usize, is_wide: bool) -> Result<u64> {
    if is_wide {
        read_le_at::<u64>(data, offset)
    } else {
        Ok(u64::from(read_le_at::<u32>(data, offset)?))
    }
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le<T: PeIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the number of bytes written.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_at<T: PeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;

    Ok(())
}

/// Writes a pointer sized value: 8 bytes when `is_wide` (PE32+), 4 bytes otherwise.
///
/// For narrow writes the value is truncated to its low 32 bits.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn write_le_at_dyn(data: &mut [u8], offset: &mut usize, value: u64, is_wide: bool) -> Result<()> {
    if is_wide {
        write_le_at(data, offset, value)
    } else {
        write_le_at(data, offset, value as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u8() {
        let result = read_le::<u8>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x01);
    }

    #[test]
    fn read_le_u16() {
        let result = read_le::<u16>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0201);
    }

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_i16() {
        let result = read_le::<i16>(&[0xFE, 0xFF]).unwrap();
        assert_eq!(result, -2);
    }

    #[test]
    fn read_le_from() {
        let mut offset = 2_usize;
        let result = read_le_at::<u16>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x403);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_le_dyn() {
        let mut offset = 0;
        let wide = read_le_at_dyn(&TEST_BUFFER, &mut offset, true).unwrap();
        assert_eq!(wide, 0x0807_0605_0403_0201);
        assert_eq!(offset, 8);

        offset = 4;
        let narrow = read_le_at_dyn(&TEST_BUFFER, &mut offset, false).unwrap();
        assert_eq!(narrow, 0x0807_0605);
        assert_eq!(offset, 8);
    }

    #[test]
    fn write_le_dyn() {
        let mut buffer = [0u8; 12];
        let mut offset = 0;
        write_le_at_dyn(&mut buffer, &mut offset, 0x1_0040_1000, false).unwrap();
        write_le_at_dyn(&mut buffer, &mut offset, 0x1_4000_1000, true).unwrap();
        assert_eq!(offset, 12);
        assert_eq!(&buffer[..4], &[0x00, 0x10, 0x40, 0x00]);
        assert_eq!(read_le::<u64>(&buffer[4..]).unwrap(), 0x1_4000_1000);
    }

    #[test]
    fn write_le_u32() {
        let mut buffer = [0u8; 4];
        write_le(&mut buffer, 0x1234_5678u32).unwrap();
        assert_eq!(buffer, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn errors() {
        let buffer = [0xFF, 0xFF, 0xFF, 0xFF];

        let result = read_le::<u64>(&buffer);
        assert!(matches!(result, Err(OutOfBounds)));

        let mut offset = usize::MAX - 1;
        let result = read_le_at::<u32>(&buffer, &mut offset);
        assert!(matches!(result, Err(OutOfBounds)));

        let mut small = [0u8; 3];
        assert!(matches!(write_le(&mut small, 1u32), Err(OutOfBounds)));
    }
}
