//! Fixed-address segment mapping.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc::off_t;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, mprotect, munmap};
use tracing::{debug, error, warn};

use sld_elf::ProgramHeader;

use crate::plan::{LoadPlan, SegmentPlan};
use crate::MapError;

/// Get flags for fixed-address mmap that fails if address is already mapped.
///
/// Uses `MAP_FIXED_NOREPLACE` on Linux (returns EEXIST if address is taken).
/// Falls back to `MAP_FIXED` on macOS/BSD (will unmap existing mappings).
#[cfg(any(target_os = "linux", target_os = "android"))]
const fn map_fixed_flags() -> MapFlags {
    MapFlags::MAP_FIXED_NOREPLACE
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const fn map_fixed_flags() -> MapFlags {
    MapFlags::MAP_FIXED
}

/// One region created for a loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    addr: NonNull<c_void>,
    len: usize,
    prot: ProtFlags,
}

impl MappedRegion {
    /// Start address (page aligned).
    #[must_use]
    pub fn base(&self) -> u64 {
        self.addr.as_ptr() as u64
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn prot(&self) -> ProtFlags {
        self.prot
    }

    /// Remove the region from the address space.
    ///
    /// # Safety
    ///
    /// Nothing may still refer to memory inside the region.
    pub unsafe fn unmap(self) -> Result<(), MapError> {
        unsafe { munmap(self.addr, self.len)? };
        Ok(())
    }
}

/// Map one loadable segment at its page-aligned link-time address.
///
/// Pages holding on-disk bytes are a private file mapping of `fd`; pages that
/// lie entirely in the zero-fill tail are anonymous. The zero-fill part of the
/// last file-backed page is cleared explicitly, with the page temporarily
/// writable, before the final protection is applied.
///
/// # Errors
///
/// Fails if the address is taken or the host refuses the mapping. Nothing
/// created by this call is left mapped on failure.
pub fn map_segment(plan: &SegmentPlan, fd: BorrowedFd<'_>) -> Result<MappedRegion, MapError> {
    let base = to_usize(plan.base)?;
    let file_span = to_usize(plan.file_span)?;
    let anon_span = to_usize(plan.anon_span)?;

    let mut file_part = None;
    if file_span > 0 {
        let initial = if plan.needs_zeroing() {
            plan.prot | ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            plan.prot
        };
        let offset = off_t::try_from(plan.file_offset)
            .map_err(|_| MapError::InvalidSize(file_span))?;

        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping.
        let addr = unsafe {
            mmap(
                Some(nonzero(base, file_span)?),
                nonzero(file_span, file_span)?,
                initial,
                MapFlags::MAP_PRIVATE | map_fixed_flags(),
                fd,
                offset,
            )
        }
        .map_err(|e| fixed_error(e, plan.base))?;
        let region = placed(addr, base, file_span, plan.base)?;

        if plan.needs_zeroing() {
            let zero = plan.zero_in_file();
            let start = to_usize(zero.start)?;
            let len = to_usize(zero.end - zero.start)?;
            // SAFETY: the range lies inside the writable mapping created above.
            unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
            if initial != plan.prot {
                // SAFETY: region was created by this call.
                if let Err(e) = unsafe { mprotect(region, file_span, plan.prot) } {
                    let _ = unsafe { munmap(region, file_span) };
                    return Err(e.into());
                }
            }
        }
        file_part = Some(region);
    }

    if anon_span > 0 {
        let anon_base = base + file_span;
        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping.
        let mapped = unsafe {
            mmap_anonymous(
                Some(nonzero(anon_base, anon_span)?),
                nonzero(anon_span, anon_span)?,
                plan.prot,
                MapFlags::MAP_PRIVATE | map_fixed_flags(),
            )
        }
        .map_err(|e| fixed_error(e, anon_base as u64))
        .and_then(|addr| placed(addr, anon_base, anon_span, anon_base as u64));

        if let Err(e) = mapped {
            if let Some(region) = file_part {
                // SAFETY: region was created by this call and is not yet shared.
                let _ = unsafe { munmap(region, file_span) };
            }
            return Err(e);
        }
    }

    let addr = NonNull::new(base as *mut c_void).ok_or(MapError::NullPage { index: plan.index })?;
    Ok(MappedRegion {
        addr,
        len: file_span + anon_span,
        prot: plan.prot,
    })
}

/// Regions created for an image, in table order.
///
/// Dropping this value does not unmap anything: once loaded, the segments
/// belong to the process for the rest of its life.
#[derive(Debug, Default)]
pub struct LoadedImage {
    regions: Vec<MappedRegion>,
}

impl LoadedImage {
    #[must_use]
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    /// Unmap every region.
    ///
    /// # Safety
    ///
    /// No code or data of the image may be in use.
    pub unsafe fn unmap(self) -> Result<(), MapError> {
        for region in self.regions.into_iter().rev() {
            unsafe { region.unmap()? };
        }
        Ok(())
    }
}

/// Maps the loadable descriptors of one image as the program header table is
/// walked, remembering what it created so a failed load can be undone.
pub struct SegmentMapper<'a> {
    plan: &'a LoadPlan,
    fd: BorrowedFd<'a>,
    loaded: LoadedImage,
}

impl<'a> SegmentMapper<'a> {
    #[must_use]
    pub const fn new(plan: &'a LoadPlan, fd: BorrowedFd<'a>) -> Self {
        Self {
            plan,
            fd,
            loaded: LoadedImage { regions: Vec::new() },
        }
    }

    /// The placement planned for table entry `index`, if it is mapped at all.
    #[must_use]
    pub fn plan_for(&self, index: usize) -> Option<&'a SegmentPlan> {
        self.plan.segments().iter().find(|s| s.index == index)
    }

    /// Map table entry `index`.
    ///
    /// Descriptors other than `PT_LOAD`, and empty loadable ones, map nothing
    /// and return `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the mapping failure. Regions mapped by earlier calls stay
    /// mapped until [`Self::rollback`].
    pub fn map_descriptor(
        &mut self,
        index: usize,
        phdr: &ProgramHeader,
    ) -> Result<Option<MappedRegion>, MapError> {
        if !phdr.is_load() {
            return Ok(None);
        }
        let Some(segment) = self.plan_for(index) else {
            return Ok(None);
        };

        let region = map_segment(segment, self.fd)?;
        debug!(
            index,
            base = format_args!("{:#x}", region.base()),
            len = region.len(),
            "mapped segment"
        );
        self.loaded.regions.push(region);
        Ok(Some(region))
    }

    /// Number of regions mapped so far.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.loaded.regions.len()
    }

    /// Unmap everything this mapper created.
    pub fn rollback(self) {
        let count = self.loaded.regions.len();
        if count == 0 {
            return;
        }
        warn!(count, "unmapping segments of failed load");
        // SAFETY: no code from the image has run yet.
        if let Err(e) = unsafe { self.loaded.unmap() } {
            error!(error = %e, "failed to unmap segments during rollback");
        }
    }

    /// Hand the mapped regions over to the process.
    #[must_use]
    pub fn finish(self) -> LoadedImage {
        self.loaded
    }
}

fn fixed_error(e: Errno, addr: u64) -> MapError {
    if e == Errno::EEXIST {
        MapError::FixedAddressUnavailable(addr)
    } else {
        MapError::MmapFailed(e)
    }
}

/// Kernels without `MAP_FIXED_NOREPLACE` treat it as a hint and may place the
/// mapping elsewhere; that counts as the address being unavailable.
fn placed(
    addr: NonNull<c_void>,
    want: usize,
    len: usize,
    requested: u64,
) -> Result<NonNull<c_void>, MapError> {
    if addr.as_ptr() as usize == want {
        Ok(addr)
    } else {
        // SAFETY: the stray mapping was just created and nothing refers to it.
        let _ = unsafe { munmap(addr, len) };
        Err(MapError::FixedAddressUnavailable(requested))
    }
}

fn to_usize(value: u64) -> Result<usize, MapError> {
    usize::try_from(value).map_err(|_| MapError::AddressOverflow { index: 0 })
}

fn nonzero(value: usize, size: usize) -> Result<NonZeroUsize, MapError> {
    NonZeroUsize::new(value).ok_or(MapError::InvalidSize(size))
}
