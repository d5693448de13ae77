//! ELF32 program header (segment descriptor).

use std::fmt;

use crate::constants::*;
use crate::view::ImageView;
use crate::Result;

/// Segment type (`p_type`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Null,
    Load,
    Dynamic,
    Interp,
    Note,
    Shlib,
    Phdr,
    Tls,
    Other(u32),
}

impl SegmentKind {
    #[must_use]
    pub const fn from_raw(p_type: u32) -> Self {
        match p_type {
            PT_NULL => Self::Null,
            PT_LOAD => Self::Load,
            PT_DYNAMIC => Self::Dynamic,
            PT_INTERP => Self::Interp,
            PT_NOTE => Self::Note,
            PT_SHLIB => Self::Shlib,
            PT_PHDR => Self::Phdr,
            PT_TLS => Self::Tls,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Null => PT_NULL,
            Self::Load => PT_LOAD,
            Self::Dynamic => PT_DYNAMIC,
            Self::Interp => PT_INTERP,
            Self::Note => PT_NOTE,
            Self::Shlib => PT_SHLIB,
            Self::Phdr => PT_PHDR,
            Self::Tls => PT_TLS,
            Self::Other(raw) => raw,
        }
    }

    /// Short name as printed in segment listings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Load => "LOAD",
            Self::Dynamic => "DYNAMIC",
            Self::Interp => "INTERP",
            Self::Note => "NOTE",
            Self::Phdr => "PHDR",
            Self::Tls => "TLS",
            Self::Shlib | Self::Other(_) => "UNKNOWN",
        }
    }
}

/// Segment permission bits (`p_flags`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SegmentFlags(u32);

impl SegmentFlags {
    pub const R: Self = Self(PF_R);
    pub const W: Self = Self(PF_W);
    pub const X: Self = Self(PF_X);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & PF_R != 0
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & PF_W != 0
    }

    #[must_use]
    pub const fn is_executable(self) -> bool {
        self.0 & PF_X != 0
    }
}

impl std::ops::BitOr for SegmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Three-column `RWE` listing, blanks for absent bits.
impl fmt::Display for SegmentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.is_readable() { 'R' } else { ' ' };
        let w = if self.is_writable() { 'W' } else { ' ' };
        let e = if self.is_executable() { 'E' } else { ' ' };
        write!(f, "{r}{w}{e}")
    }
}

/// Program header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: SegmentKind,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: SegmentFlags,
    pub align: u32,
}

impl ProgramHeader {
    /// Parse one 32-byte descriptor at `offset`.
    pub fn parse(view: &ImageView<'_>, offset: usize) -> Result<Self> {
        // One range check for the whole entry before decoding fields.
        view.bytes(offset, PHDR_SIZE)?;
        Ok(Self {
            kind: SegmentKind::from_raw(view.read_le32(offset)?),
            offset: view.read_le32(offset + 4)?,
            vaddr: view.read_le32(offset + 8)?,
            paddr: view.read_le32(offset + 12)?,
            filesz: view.read_le32(offset + 16)?,
            memsz: view.read_le32(offset + 20)?,
            flags: SegmentFlags::from_bits(view.read_le32(offset + 24)?),
            align: view.read_le32(offset + 28)?,
        })
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        self.kind == SegmentKind::Load
    }

    /// Size of the zero-filled tail (BSS).
    #[must_use]
    pub const fn bss_size(&self) -> u32 {
        self.memsz.saturating_sub(self.filesz)
    }

    /// Whether `vaddr` falls inside this segment's memory image.
    #[must_use]
    pub fn contains_vaddr(&self, vaddr: u32) -> bool {
        vaddr >= self.vaddr && u64::from(vaddr) < u64::from(self.vaddr) + u64::from(self.memsz)
    }

    /// Whether file offset `offset` falls inside this segment's on-disk bytes.
    #[must_use]
    pub fn contains_offset(&self, offset: u32) -> bool {
        offset >= self.offset
            && u64::from(offset) < u64::from(self.offset) + u64::from(self.filesz)
    }
}
