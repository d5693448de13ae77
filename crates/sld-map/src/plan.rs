//! Page-level placement of loadable segments.
//!
//! A [`LoadPlan`] is computed from the program header table before anything
//! is mapped, so every rejectable layout is rejected while the address space
//! is still untouched.

use std::ops::Range;

use nix::sys::mman::ProtFlags;
use sld_elf::{ElfImage, ElfError, ProgramHeader, SegmentFlags};
use tracing::debug;

use crate::page::PageSize;
use crate::prot::prot_flags;
use crate::MapError;

/// Largest address a 32-bit image can reach (exclusive).
const ADDRESS_LIMIT: u64 = 1 << 32;

/// Placement of one loadable segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Index in the program header table.
    pub index: usize,
    pub vaddr: u32,
    pub offset: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: SegmentFlags,
    /// Page-aligned virtual address.
    pub base: u64,
    /// Page-aligned file offset.
    pub file_offset: u64,
    /// Low bits cleared from both the address and the offset.
    pub remainder: u64,
    /// Bytes requested from `base`: `memsz + remainder`.
    pub length: u64,
    /// Bytes of file-backed mapping starting at `base` (whole pages).
    pub file_span: u64,
    /// Bytes of anonymous mapping after the file-backed part (whole pages).
    pub anon_span: u64,
    /// Page protection derived from `flags`.
    pub prot: ProtFlags,
}

impl SegmentPlan {
    /// Compute placement for a `PT_LOAD` descriptor.
    ///
    /// `file_len` is the size of the backing file; on-disk bytes must lie
    /// inside it.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor cannot be mapped at its link-time address.
    pub fn new(
        index: usize,
        phdr: &ProgramHeader,
        file_len: u64,
        page: PageSize,
    ) -> Result<Self, MapError> {
        let vaddr = u64::from(phdr.vaddr);
        let offset = u64::from(phdr.offset);
        let filesz = u64::from(phdr.filesz);
        let memsz = u64::from(phdr.memsz);

        if memsz < filesz {
            return Err(MapError::SizeMismatch {
                index,
                filesz: phdr.filesz,
                memsz: phdr.memsz,
            });
        }
        if offset + filesz > file_len {
            return Err(MapError::SegmentBeyondFile { index });
        }
        if vaddr + memsz > ADDRESS_LIMIT {
            return Err(MapError::AddressOverflow { index });
        }

        let remainder = page.remainder(vaddr);
        if page.remainder(offset) != remainder {
            return Err(MapError::MisalignedSegment {
                index,
                vaddr: phdr.vaddr,
                offset: phdr.offset,
                page: page.get(),
            });
        }

        let base = page.align_down(vaddr);
        if base == 0 {
            return Err(MapError::NullPage { index });
        }

        let length = memsz + remainder;
        let file_span = if filesz == 0 {
            0
        } else {
            page.align_up(remainder + filesz)
        };
        let anon_span = page.align_up(length) - file_span;

        Ok(Self {
            index,
            vaddr: phdr.vaddr,
            offset: phdr.offset,
            filesz: phdr.filesz,
            memsz: phdr.memsz,
            flags: phdr.flags,
            base,
            file_offset: page.align_down(offset),
            remainder,
            length,
            file_span,
            anon_span,
            prot: prot_flags(phdr.flags),
        })
    }

    /// Total bytes of address space reserved, whole pages.
    #[must_use]
    pub const fn mapped_len(&self) -> u64 {
        self.file_span + self.anon_span
    }

    /// Page range occupied by the segment.
    #[must_use]
    pub const fn page_range(&self) -> Range<u64> {
        self.base..self.base + self.mapped_len()
    }

    /// Virtual range that must read as zero (`filesz..memsz`).
    #[must_use]
    pub fn zero_range(&self) -> Range<u64> {
        let vaddr = u64::from(self.vaddr);
        vaddr + u64::from(self.filesz)..vaddr + u64::from(self.memsz)
    }

    /// Part of [`Self::zero_range`] that lies in file-backed pages and has
    /// to be cleared explicitly. Anonymous pages are already zero.
    #[must_use]
    pub fn zero_in_file(&self) -> Range<u64> {
        let zero = self.zero_range();
        let file_end = self.base + self.file_span;
        zero.start..zero.end.min(file_end).max(zero.start)
    }

    /// Whether the file-backed part needs a write pass before its final
    /// protection is applied.
    #[must_use]
    pub fn needs_zeroing(&self) -> bool {
        self.file_span > 0 && !self.zero_in_file().is_empty()
    }
}

/// Placement of every loadable segment of an image, in table order.
#[derive(Clone, Debug)]
pub struct LoadPlan {
    segments: Vec<SegmentPlan>,
    page: PageSize,
}

impl LoadPlan {
    /// Plan all `PT_LOAD` segments of `image`.
    ///
    /// Segments with `memsz == 0` occupy no memory and are skipped.
    ///
    /// # Errors
    ///
    /// Fails on the first segment that cannot be placed, when two segments
    /// share a page, or when there is nothing to load.
    pub fn build(image: &ElfImage<'_>, page: PageSize) -> Result<Self, MapError> {
        let file_len = image.file_len() as u64;
        let mut segments: Vec<SegmentPlan> = Vec::new();

        for (index, phdr) in image.segments().enumerate() {
            let phdr = phdr?;
            if !phdr.is_load() {
                continue;
            }
            if phdr.memsz == 0 {
                debug!(index, vaddr = phdr.vaddr, "skipping empty load segment");
                continue;
            }

            let plan = SegmentPlan::new(index, &phdr, file_len, page)?;
            let range = plan.page_range();
            if let Some(other) = segments.iter().find(|s| {
                let r = s.page_range();
                range.start < r.end && r.start < range.end
            }) {
                return Err(MapError::OverlappingSegments {
                    first: other.index,
                    second: index,
                });
            }
            segments.push(plan);
        }

        if segments.is_empty() {
            return Err(ElfError::NoLoadableSegments.into());
        }

        Ok(Self { segments, page })
    }

    #[must_use]
    pub fn segments(&self) -> &[SegmentPlan] {
        &self.segments
    }

    #[must_use]
    pub const fn page(&self) -> PageSize {
        self.page
    }

    /// Sum of the reserved page spans.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(SegmentPlan::mapped_len).sum()
    }
}
