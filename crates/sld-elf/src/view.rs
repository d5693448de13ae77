//! Bounds-checked little-endian reads over an untrusted byte buffer.

use crate::constants::EI_NIDENT;
use crate::{ElfError, Result};

/// Read-only view over raw image bytes.
///
/// Every read is checked against the buffer length and fails with
/// [`ElfError::OutOfBounds`] instead of reading past the end.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Length of the underlying buffer.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(ElfError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            })
    }

    /// The identification block at the start of the image.
    pub fn ident(&self) -> Result<&'a [u8; EI_NIDENT]> {
        let bytes = self.bytes(0, EI_NIDENT)?;
        bytes.try_into().map_err(|_| ElfError::TooSmall)
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    /// Read little-endian u16.
    #[inline]
    pub fn read_le16(&self, offset: usize) -> Result<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read little-endian u32.
    #[inline]
    pub fn read_le32(&self, offset: usize) -> Result<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
