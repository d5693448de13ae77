//! Host page geometry.

use nix::unistd::{SysconfVar, sysconf};

use crate::MapError;

/// A power-of-two page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSize(u64);

impl PageSize {
    /// Wrap `size` if it is a power of two.
    #[must_use]
    pub const fn new(size: u64) -> Option<Self> {
        if size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    /// Query the host page size (`sysconf(_SC_PAGESIZE)`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or reports a size that is not a
    /// power of two.
    pub fn host() -> Result<Self, MapError> {
        let raw = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .ok_or(MapError::InvalidPageSize(0))?;
        let size = u64::try_from(raw).map_err(|_| MapError::InvalidPageSize(0))?;
        Self::new(size).ok_or(MapError::InvalidPageSize(size))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Round down to a page boundary.
    #[must_use]
    pub const fn align_down(self, value: u64) -> u64 {
        value & !(self.0 - 1)
    }

    /// Round up to a page boundary.
    #[must_use]
    pub const fn align_up(self, value: u64) -> u64 {
        (value + self.0 - 1) & !(self.0 - 1)
    }

    /// Offset of `value` within its page.
    #[must_use]
    pub const fn remainder(self, value: u64) -> u64 {
        value & (self.0 - 1)
    }
}
