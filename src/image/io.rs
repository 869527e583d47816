//! Bounds-checked little-endian access to image buffers.
//!
//! PE structures are little-endian throughout. These helpers read and write primitive values
//! at a running offset, advancing it past the value, and refuse any access that would leave
//! the buffer with [`crate::Error::OutOfBounds`].
//!
//! ```rust,ignore
//! let mut header = [0u8; 8];
//! let mut offset = 0;
//! write_le_at(&mut header, &mut offset, 0x5a4d_u16)?;
//! write_le_at(&mut header, &mut offset, 64_u32)?;
//! assert_eq!(offset, 6);
//!
//! let mut offset = 0;
//! let magic: u16 = read_le_at(&header, &mut offset)?;
//! assert_eq!(magic, 0x5a4d);
//! ```

use crate::{Error::OutOfBounds, Result};

/// Primitive values that can be stored in an image buffer.
pub trait PeIO: Sized + Copy {
    /// Fixed-size byte representation of the value
    type Bytes: AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes a little-endian byte array.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes the value as a little-endian byte array.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pe_io {
    ($($ty:ty => $n:expr),* $(,)?) => {
        $(
            impl PeIO for $ty {
                type Bytes = [u8; $n];

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

impl_pe_io!(u8 => 1, u16 => 2, u32 => 4, u64 => 8, i32 => 4);

/// Reads a little-endian value at `offset` and advances `offset` past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data` at `offset`.
pub fn read_le_at<T: PeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Reads a little-endian value at the fixed position `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data` at `offset`.
pub fn read_le<T: PeIO>(data: &[u8], offset: usize) -> Result<T> {
    let mut offset = offset;
    read_le_at(data, &mut offset)
}

/// Writes a little-endian value at `offset` and advances `offset` past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data` at `offset`.
pub fn write_le_at<T: PeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

/// Writes raw bytes at `offset` and advances `offset` past them.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `bytes` does not fit in `data` at `offset`.
pub fn write_bytes_at(data: &mut [u8], offset: &mut usize, bytes: &[u8]) -> Result<()> {
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn roundtrip_mixed_widths() {
        let mut data = [0u8; 15];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 0xAB_u8).unwrap();
        write_le_at(&mut data, &mut offset, 0x1234_u16).unwrap();
        write_le_at(&mut data, &mut offset, -2_i32).unwrap();
        write_le_at(&mut data, &mut offset, 0x0102_0304_0506_0708_u64).unwrap();
        assert_eq!(offset, 15);
        assert_eq!(&data[..3], &[0xAB, 0x34, 0x12]);

        let mut offset = 0;
        assert_eq!(read_le_at::<u8>(&data, &mut offset).unwrap(), 0xAB);
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x1234);
        assert_eq!(read_le_at::<i32>(&data, &mut offset).unwrap(), -2);
        assert_eq!(read_le::<u64>(&data, 7).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn out_of_bounds() {
        let mut data = [0u8; 3];
        let mut offset = 0;
        assert!(matches!(
            write_le_at(&mut data, &mut offset, 1_u32),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(offset, 0);
        assert!(read_le::<u16>(&data, 2).is_err());
        assert!(read_le::<u16>(&data, usize::MAX).is_err());

        let mut offset = 2;
        assert!(write_bytes_at(&mut data, &mut offset, b"MZ").is_err());
        assert!(write_bytes_at(&mut data, &mut offset, b"M").is_ok());
        assert_eq!(offset, 3);
    }
}
