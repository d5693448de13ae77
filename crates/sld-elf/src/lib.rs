//! ELF32 parser for the static loader.
//!
//! All reads go through [`ImageView`], which refuses to index past the end of
//! the buffer. The identification block is checked before any other header
//! field is trusted.

pub mod builder;
mod constants;
mod header;
mod image;
mod segment;
mod table;
mod view;

pub use builder::{ImageBuilder, SegmentSpec};
pub use constants::*;
pub use header::*;
pub use image::*;
pub use segment::*;
pub use table::*;
pub use view::*;

use thiserror::Error;

/// ELF parsing errors.
#[derive(Error, Debug)]
pub enum ElfError {
    #[error("ELF data too small")]
    TooSmall,
    #[error("Invalid ELF magic number")]
    InvalidMagic,
    #[error("Only little-endian ELF supported")]
    NotLittleEndian,
    #[error("Unsupported ELF class: {0} (expected ELFCLASS32)")]
    UnsupportedClass(u8),
    #[error("read of {len} bytes at offset {offset:#x} is outside the {size}-byte image")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Program header out of bounds")]
    ProgramOutOfBounds,
    #[error("Unexpected program header entry size: {0}")]
    BadEntrySize(u16),
    #[error("Not a fixed-address executable (e_type {0}); position-independent images are not supported")]
    NotExecutable(u16),
    #[error("No loadable segments found")]
    NoLoadableSegments,
}

pub type Result<T> = std::result::Result<T, ElfError>;
