//! Synthesise ELF32 executables from segment descriptions.
//!
//! Produces a minimal little-endian `ET_EXEC` image: file header, program
//! header table directly after it, then segment contents. Loadable segments
//! are placed at file offsets congruent to their virtual address modulo the
//! builder's alignment, as a linker would.

use crate::constants::*;
use crate::segment::{SegmentFlags, SegmentKind};

/// Default congruence between file offsets and virtual addresses.
pub const DEFAULT_ALIGN: u32 = 0x1000;

/// One segment to emit.
#[derive(Clone, Debug)]
pub struct SegmentSpec {
    kind: SegmentKind,
    vaddr: u32,
    flags: SegmentFlags,
    data: Vec<u8>,
    bss: u32,
    offset: Option<u32>,
    filesz: Option<u32>,
    align: Option<u32>,
}

impl SegmentSpec {
    #[must_use]
    pub const fn new(kind: SegmentKind, vaddr: u32, flags: SegmentFlags) -> Self {
        Self {
            kind,
            vaddr,
            flags,
            data: Vec::new(),
            bss: 0,
            offset: None,
            filesz: None,
            align: None,
        }
    }

    /// A `PT_LOAD` segment.
    #[must_use]
    pub const fn load(vaddr: u32, flags: SegmentFlags) -> Self {
        Self::new(SegmentKind::Load, vaddr, flags)
    }

    /// File contents of the segment.
    #[must_use]
    pub fn code(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Zero-filled bytes after the file contents.
    #[must_use]
    pub const fn bss(mut self, size: u32) -> Self {
        self.bss = size;
        self
    }

    /// Pin the segment to a file offset instead of placing it after the
    /// previous one. Offset 0 makes the segment cover the headers.
    #[must_use]
    pub const fn at_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Override `p_filesz`; the file is padded so those bytes exist.
    #[must_use]
    pub const fn file_size(mut self, filesz: u32) -> Self {
        self.filesz = Some(filesz);
        self
    }

    /// Override `p_align`.
    #[must_use]
    pub const fn align(mut self, align: u32) -> Self {
        self.align = Some(align);
        self
    }
}

/// Builder for synthetic ELF32 images.
#[derive(Clone, Debug)]
pub struct ImageBuilder {
    entry: u32,
    e_type: u16,
    machine: u16,
    align: u32,
    segments: Vec<SegmentSpec>,
    trailer: Vec<u8>,
}

impl ImageBuilder {
    #[must_use]
    pub const fn new(entry: u32) -> Self {
        Self {
            entry,
            e_type: ET_EXEC,
            machine: EM_386,
            align: DEFAULT_ALIGN,
            segments: Vec::new(),
            trailer: Vec::new(),
        }
    }

    #[must_use]
    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        self.segments.push(segment);
        self
    }

    #[must_use]
    pub const fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    #[must_use]
    pub const fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Offset/address congruence used when placing loadable segments.
    #[must_use]
    pub const fn page_align(mut self, align: u32) -> Self {
        self.align = align;
        self
    }

    /// Bytes appended after all segment contents.
    #[must_use]
    pub fn trailer(mut self, bytes: &[u8]) -> Self {
        self.trailer = bytes.to_vec();
        self
    }

    /// Serialise the image.
    ///
    /// # Panics
    ///
    /// Panics if the layout does not fit in a 32-bit file.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let table_end = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut out = vec![0u8; table_end];

        self.write_header(&mut out, phnum);

        let mut cursor = to_u32(table_end);
        for (i, seg) in self.segments.iter().enumerate() {
            let offset = seg.offset.unwrap_or_else(|| {
                if seg.kind == SegmentKind::Load {
                    congruent_offset(cursor, seg.vaddr, self.align)
                } else {
                    cursor
                }
            });
            let filesz = seg.filesz.unwrap_or_else(|| to_u32(seg.data.len()));
            let memsz = filesz + seg.bss;

            let start = offset as usize;
            let end = start + seg.data.len().max(filesz as usize);
            if out.len() < end {
                out.resize(end, 0);
            }
            if !seg.data.is_empty() {
                out[start..start + seg.data.len()].copy_from_slice(&seg.data);
            }
            cursor = cursor.max(to_u32(end));

            let phdr = [
                seg.kind.raw(),
                offset,
                seg.vaddr,
                seg.vaddr,
                filesz,
                memsz,
                seg.flags.bits(),
                seg.align.unwrap_or(self.align),
            ];
            let at = EHDR_SIZE + i * PHDR_SIZE;
            for (j, word) in phdr.iter().enumerate() {
                out[at + j * 4..at + j * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
        }

        out.extend_from_slice(&self.trailer);
        out
    }

    fn write_header(&self, out: &mut [u8], phnum: usize) {
        out[..4].copy_from_slice(&ELF_MAGIC);
        out[EI_CLASS] = ELF_CLASS_32;
        out[EI_DATA] = ELF_DATA_LSB;
        out[EI_VERSION] = ELF_VERSION_CURRENT;
        put16(out, E_TYPE, self.e_type);
        put16(out, E_MACHINE, self.machine);
        put32(out, 20, u32::from(ELF_VERSION_CURRENT));
        put32(out, E_ENTRY, self.entry);
        put32(out, E_PHOFF, if phnum == 0 { 0 } else { to_u32(EHDR_SIZE) });
        put16(out, 40, to_u16(EHDR_SIZE));
        put16(out, E_PHENTSIZE, to_u16(PHDR_SIZE));
        put16(out, E_PHNUM, to_u16(phnum));
    }
}

fn congruent_offset(cursor: u32, vaddr: u32, align: u32) -> u32 {
    if align <= 1 {
        return cursor;
    }
    let want = vaddr % align;
    let base = cursor - cursor % align;
    let candidate = base + want;
    if candidate >= cursor {
        candidate
    } else {
        candidate + align
    }
}

fn put16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("image larger than 4 GiB")
}

fn to_u16(value: usize) -> u16 {
    u16::try_from(value).expect("too many program headers")
}
