//! Validated ELF32 image.

use crate::constants::*;
use crate::header::{ElfHeader, check_ident, read_header};
use crate::segment::SegmentKind;
use crate::table::{SegmentTable, Segments};
use crate::view::ImageView;
use crate::{ElfError, Result};

/// An image whose identification block has been checked and whose header
/// has been read. Borrowing the raw bytes, it stays valid only as long as the
/// backing mapping does.
#[derive(Clone, Copy, Debug)]
pub struct ElfImage<'a> {
    view: ImageView<'a>,
    header: ElfHeader,
}

impl<'a> ElfImage<'a> {
    /// Validate `data` and read its header.
    ///
    /// The identification block is checked before any other field is read.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let view = ImageView::new(data);
        let ident = view.ident().map_err(|_| ElfError::TooSmall)?;
        check_ident(ident)?;

        let header = read_header(&view)?;
        if header.phnum > 0 && header.phentsize as usize != PHDR_SIZE {
            return Err(ElfError::BadEntrySize(header.phentsize));
        }

        Ok(Self { view, header })
    }

    #[must_use]
    pub const fn header(&self) -> &ElfHeader {
        &self.header
    }

    #[must_use]
    pub const fn entry_point(&self) -> u32 {
        self.header.entry
    }

    #[must_use]
    pub const fn view(&self) -> ImageView<'a> {
        self.view
    }

    /// Size of the backing buffer.
    #[must_use]
    pub const fn file_len(&self) -> usize {
        self.view.len()
    }

    /// The program header table.
    #[must_use]
    pub const fn table(&self) -> SegmentTable<'a> {
        SegmentTable::new(self.view, self.header.phoff, self.header.phnum)
    }

    /// Walk all program headers in table order.
    #[must_use]
    pub const fn segments(&self) -> Segments<'a> {
        self.table().iter()
    }

    /// Reject images that cannot be loaded at their link-time addresses.
    pub const fn require_fixed_address(&self) -> Result<()> {
        if self.header.is_executable() {
            Ok(())
        } else {
            Err(ElfError::NotExecutable(self.header.e_type))
        }
    }

    /// Virtual address at which the program header table will be visible
    /// once the image is mapped.
    ///
    /// Uses `PT_PHDR` when present, otherwise the loadable segment whose file
    /// contents include the table.
    pub fn phdr_vaddr(&self) -> Result<Option<u32>> {
        let phoff = self.header.phoff;
        let mut covering = None;
        for phdr in self.segments() {
            let phdr = phdr?;
            match phdr.kind {
                SegmentKind::Phdr => return Ok(Some(phdr.vaddr)),
                SegmentKind::Load if covering.is_none() && phdr.contains_offset(phoff) => {
                    covering = Some(phdr.vaddr.wrapping_add(phoff - phdr.offset));
                }
                _ => {}
            }
        }
        Ok(covering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ImageBuilder, SegmentSpec};
    use crate::segment::{ProgramHeader, SegmentFlags};

    fn rx() -> SegmentFlags {
        SegmentFlags::R | SegmentFlags::X
    }

    #[test]
    fn test_parse_minimal_image() {
        let data = ImageBuilder::new(0x0804_8000)
            .segment(SegmentSpec::load(0x0804_8000, rx()).code(&[0xF4]))
            .build();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.entry_point(), 0x0804_8000);
        assert_eq!(image.table().len(), 1);
        assert_eq!(image.segments().filter(|p| p.as_ref().is_ok_and(ProgramHeader::is_load)).count(), 1);
        assert!(image.require_fixed_address().is_ok());
    }

    #[test]
    fn test_corrupted_magic() {
        let mut data = ImageBuilder::new(0x1000).build();
        data[0] = 0;
        assert!(matches!(ElfImage::parse(&data), Err(ElfError::InvalidMagic)));
    }

    #[test]
    fn test_elf64_class_rejected() {
        let mut data = ImageBuilder::new(0x1000).build();
        data[EI_CLASS] = ELF_CLASS_64;
        assert!(matches!(
            ElfImage::parse(&data),
            Err(ElfError::UnsupportedClass(ELF_CLASS_64))
        ));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(ElfImage::parse(&[0x7F, b'E']), Err(ElfError::TooSmall)));
        assert!(matches!(ElfImage::parse(&[]), Err(ElfError::TooSmall)));
    }

    #[test]
    fn test_bad_entry_size() {
        let mut data = ImageBuilder::new(0x1000)
            .segment(SegmentSpec::load(0x1000, rx()).code(&[0]))
            .build();
        data[E_PHENTSIZE] = 40;
        assert!(matches!(ElfImage::parse(&data), Err(ElfError::BadEntrySize(40))));
    }

    #[test]
    fn test_shared_object_not_fixed_address() {
        let data = ImageBuilder::new(0x1000).e_type(ET_DYN).build();
        let image = ElfImage::parse(&data).unwrap();
        assert!(matches!(
            image.require_fixed_address(),
            Err(ElfError::NotExecutable(ET_DYN))
        ));
    }

    #[test]
    fn test_phdr_vaddr_from_covering_load() {
        let data = ImageBuilder::new(0x0804_8054)
            .segment(SegmentSpec::load(0x0804_8000, rx()).at_offset(0).file_size(0x80))
            .build();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.phdr_vaddr().unwrap(), Some(0x0804_8000 + EHDR_SIZE as u32));
    }

    #[test]
    fn test_phdr_vaddr_prefers_pt_phdr() {
        let data = ImageBuilder::new(0x0804_8054)
            .segment(SegmentSpec::new(SegmentKind::Phdr, 0x0804_8034, SegmentFlags::R).at_offset(52).file_size(64))
            .segment(SegmentSpec::load(0x0804_8000, rx()).at_offset(0).file_size(0x80))
            .build();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.phdr_vaddr().unwrap(), Some(0x0804_8034));
    }

    #[test]
    fn test_phdr_vaddr_unresolvable() {
        let data = ImageBuilder::new(0x0804_9000)
            .segment(SegmentSpec::load(0x0804_9000, rx()).code(&[0xC3]))
            .build();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(image.phdr_vaddr().unwrap(), None);
    }
}
