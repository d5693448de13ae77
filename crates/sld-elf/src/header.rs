//! ELF32 file header: identification checks and field extraction.

use crate::constants::*;
use crate::view::ImageView;
use crate::{ElfError, Result};

/// Check the identification block: ELF magic and 32-bit class.
///
/// Only the identification block is visible to this function, so nothing
/// past it can be consulted before the image is known to be ELF32.
#[must_use]
pub fn validate(ident: &[u8; EI_NIDENT]) -> bool {
    ident[..ELF_MAGIC.len()] == ELF_MAGIC && ident[EI_CLASS] == ELF_CLASS_32
}

/// Like [`validate`], but says what is wrong.
///
/// Also requires little-endian data encoding, which is the only byte order
/// the header reader understands.
pub fn check_ident(ident: &[u8; EI_NIDENT]) -> Result<()> {
    if !validate(ident) {
        return Err(if ident[..ELF_MAGIC.len()] == ELF_MAGIC {
            ElfError::UnsupportedClass(ident[EI_CLASS])
        } else {
            ElfError::InvalidMagic
        });
    }
    if ident[EI_DATA] != ELF_DATA_LSB {
        return Err(ElfError::NotLittleEndian);
    }
    Ok(())
}

/// ELF32 header fields the loader needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Whether the image is a fixed-address executable (`ET_EXEC`).
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        self.e_type == ET_EXEC
    }
}

/// Extract the header fields from an image that already passed [`validate`].
///
/// No semantic checks are made here. A truncated header still fails cleanly
/// because reads go through the bounds-checked view.
pub fn read_header(view: &ImageView<'_>) -> Result<ElfHeader> {
    Ok(ElfHeader {
        class: view.read_u8(EI_CLASS)?,
        data: view.read_u8(EI_DATA)?,
        version: view.read_u8(EI_VERSION)?,
        e_type: view.read_le16(E_TYPE)?,
        machine: view.read_le16(E_MACHINE)?,
        entry: view.read_le32(E_ENTRY)?,
        phoff: view.read_le32(E_PHOFF)?,
        phentsize: view.read_le16(E_PHENTSIZE)?,
        phnum: view.read_le16(E_PHNUM)?,
    })
}
