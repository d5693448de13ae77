//! Program header table walker.

use crate::constants::PHDR_SIZE;
use crate::segment::ProgramHeader;
use crate::view::ImageView;
use crate::{ElfError, Result};

/// The program header table of an image: `count` descriptors at `offset`.
///
/// Walking is lazy and restartable: each call to [`SegmentTable::iter`]
/// starts again at index 0 and decodes descriptors on demand.
#[derive(Clone, Copy, Debug)]
pub struct SegmentTable<'a> {
    view: ImageView<'a>,
    offset: u32,
    count: u16,
}

impl<'a> SegmentTable<'a> {
    #[must_use]
    pub const fn new(view: ImageView<'a>, offset: u32, count: u16) -> Self {
        Self {
            view,
            offset,
            count,
        }
    }

    /// Number of descriptors in the table.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// File offset of the table.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Iterate descriptors in table order.
    #[must_use]
    pub const fn iter(&self) -> Segments<'a> {
        Segments {
            table: *self,
            index: 0,
        }
    }

    /// Decode the descriptor at `index`.
    pub fn get(&self, index: usize) -> Result<ProgramHeader> {
        if index >= self.len() {
            return Err(ElfError::ProgramOutOfBounds);
        }
        let offset = (self.offset as usize)
            .checked_add(index * PHDR_SIZE)
            .ok_or(ElfError::ProgramOutOfBounds)?;
        ProgramHeader::parse(&self.view, offset)
    }
}

impl<'a> IntoIterator for &SegmentTable<'a> {
    type Item = Result<ProgramHeader>;
    type IntoIter = Segments<'a>;

    fn into_iter(self) -> Segments<'a> {
        self.iter()
    }
}

/// Iterator over a [`SegmentTable`].
#[derive(Clone, Debug)]
pub struct Segments<'a> {
    table: SegmentTable<'a>,
    index: usize,
}

impl Iterator for Segments<'_> {
    type Item = Result<ProgramHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.table.len() {
            return None;
        }
        let item = self.table.get(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.table.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Segments<'_> {}

/// Apply `visitor` to every descriptor in table order.
///
/// `ctx` is handed to each call unchanged; the loader uses it to carry the
/// backing file descriptor to the segment mapper. Stops at the first decode
/// error or visitor error.
pub fn for_each_segment<C, E, F>(table: &SegmentTable<'_>, ctx: &mut C, mut visitor: F) -> std::result::Result<(), E>
where
    E: From<ElfError>,
    F: FnMut(usize, &ProgramHeader, &mut C) -> std::result::Result<(), E>,
{
    for (index, phdr) in table.iter().enumerate() {
        visitor(index, &phdr?, ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ImageBuilder, SegmentSpec};
    use crate::segment::{SegmentFlags, SegmentKind};

    fn three_segment_image() -> Vec<u8> {
        ImageBuilder::new(0x0804_8000)
            .segment(SegmentSpec::load(0x0804_8000, SegmentFlags::R | SegmentFlags::X).code(&[0x90; 16]))
            .segment(SegmentSpec::new(SegmentKind::Note, 0, SegmentFlags::R))
            .segment(SegmentSpec::load(0x0804_A000, SegmentFlags::R | SegmentFlags::W).bss(0x40))
            .build()
    }

    #[test]
    fn test_walk_in_table_order() {
        let data = three_segment_image();
        let view = ImageView::new(&data);
        let header = crate::read_header(&view).unwrap();
        let table = SegmentTable::new(view, header.phoff, header.phnum);

        let kinds: Vec<_> = table.iter().map(|p| p.unwrap().kind).collect();
        assert_eq!(kinds, [SegmentKind::Load, SegmentKind::Note, SegmentKind::Load]);
        assert_eq!(table.iter().len(), 3);
    }

    #[test]
    fn test_walk_is_restartable() {
        let data = three_segment_image();
        let view = ImageView::new(&data);
        let header = crate::read_header(&view).unwrap();
        let table = SegmentTable::new(view, header.phoff, header.phnum);

        let first: Vec<_> = table.iter().collect::<Result<_>>().unwrap();
        let second: Vec<_> = (&table).into_iter().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_visitor_receives_context() {
        let data = three_segment_image();
        let view = ImageView::new(&data);
        let header = crate::read_header(&view).unwrap();
        let table = SegmentTable::new(view, header.phoff, header.phnum);

        let mut seen = Vec::new();
        for_each_segment(&table, &mut seen, |index, phdr, seen: &mut Vec<(usize, u32)>| {
            seen.push((index, phdr.vaddr));
            Ok::<_, ElfError>(())
        })
        .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (0, 0x0804_8000));
        assert_eq!(seen[2].0, 2);
    }

    #[test]
    fn test_visitor_error_stops_walk() {
        let data = three_segment_image();
        let view = ImageView::new(&data);
        let header = crate::read_header(&view).unwrap();
        let table = SegmentTable::new(view, header.phoff, header.phnum);

        let mut calls = 0;
        let result = for_each_segment(&table, &mut calls, |_, _, calls: &mut i32| {
            *calls += 1;
            Err(ElfError::NoLoadableSegments)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_table_past_end_of_buffer() {
        let data = three_segment_image();
        let view = ImageView::new(&data);
        let table = SegmentTable::new(view, u32::try_from(data.len()).unwrap() - 8, 2);

        let first = table.iter().next().unwrap();
        assert!(matches!(first, Err(ElfError::OutOfBounds { .. })));
        assert!(matches!(table.get(2), Err(ElfError::ProgramOutOfBounds)));
    }
}
