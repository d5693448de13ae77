//! Read-only mapping of a whole image file.

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};

use crate::MapError;

/// Private read-only mapping of an entire file, unmapped on drop.
///
/// Used only to read the header and program header table; it is released
/// before control leaves the loader.
pub struct FileMapping {
    addr: NonNull<c_void>,
    len: usize,
}

impl FileMapping {
    /// Map the first `len` bytes of `file` read-only.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty file or if mmap fails.
    pub fn map(file: &File, len: u64) -> Result<Self, MapError> {
        let len = usize::try_from(len).map_err(|_| MapError::InvalidSize(usize::MAX))?;
        let len_nz = NonZeroUsize::new(len).ok_or(MapError::EmptyFile)?;

        let addr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file,
                0,
            )?
        };

        Ok(Self { addr, len })
    }

    /// The mapped file contents.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr().cast::<u8>(), self.len) }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr, self.len);
        }
    }
}
