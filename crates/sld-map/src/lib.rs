//! Placement and fixed-address mapping of ELF32 loadable segments.
//!
//! The flow is plan first, map second:
//!
//! ```ignore
//! use sld_elf::for_each_segment;
//! use sld_map::{LoadPlan, PageSize, SegmentMapper};
//!
//! let plan = LoadPlan::build(&image, PageSize::host()?)?;
//! let mut mapper = SegmentMapper::new(&plan, file.as_fd());
//! for_each_segment(&image.table(), &mut mapper, |i, phdr, m| m.map_descriptor(i, phdr).map(drop))?;
//! let loaded = mapper.finish();
//! ```
//!
//! Everything that can be rejected is rejected while building the plan.
//! A failed mapping can be undone with [`SegmentMapper::rollback`], so a
//! load either places every segment or leaves none behind.

mod file;
mod mapper;
mod page;
mod plan;
mod prot;

pub use file::FileMapping;
pub use mapper::{LoadedImage, MappedRegion, SegmentMapper, map_segment};
pub use page::PageSize;
pub use plan::{LoadPlan, SegmentPlan};
pub use prot::{prot_flags, prot_names};

pub use nix::sys::mman::ProtFlags;

use sld_elf::ElfError;
use thiserror::Error;

/// Segment mapping error.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("mmap failed: {0}")]
    MmapFailed(#[from] nix::Error),

    #[error("fixed address {0:#x} is not available (already mapped or reserved)")]
    FixedAddressUnavailable(u64),

    #[error("invalid memory size: {0}")]
    InvalidSize(usize),

    #[error("invalid host page size: {0}")]
    InvalidPageSize(u64),

    #[error("image file is empty")]
    EmptyFile,

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error(
        "segment {index}: address {vaddr:#010x} and offset {offset:#x} differ modulo the page size {page:#x}"
    )]
    MisalignedSegment {
        index: usize,
        vaddr: u32,
        offset: u32,
        page: u64,
    },

    #[error("segment {index}: memory size {memsz:#x} is smaller than file size {filesz:#x}")]
    SizeMismatch { index: usize, filesz: u32, memsz: u32 },

    #[error("segment {index} extends beyond file")]
    SegmentBeyondFile { index: usize },

    #[error("segment {index}: virtual address range overflows 32 bits")]
    AddressOverflow { index: usize },

    #[error("segment {index} would be mapped at page zero")]
    NullPage { index: usize },

    #[error("segments {first} and {second} share a page")]
    OverlappingSegments { first: usize, second: usize },
}
