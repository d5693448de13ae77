//! Human-readable load report.

use std::io::{self, Write};

use console::style;
use sld_elf::{ElfHeader, ProgramHeader};
use sld_map::{MappedRegion, prot_flags, prot_names};

/// Column header of the program header listing.
pub const TABLE_HEADER: &str =
    "Type           Offset   VirtAddr   PhysAddr   FileSiz MemSiz  Flg Align";

/// Writes the load report.
///
/// Tracks whether the program header column header has been written, so a
/// reporter prints it once no matter how many tables it is fed.
pub struct Reporter<W: Write> {
    out: W,
    table_header_written: bool,
}

impl Reporter<io::Stdout> {
    /// Report to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl Reporter<io::Sink> {
    /// Discard the report.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(io::sink())
    }
}

impl<W: Write> Reporter<W> {
    pub const fn new(out: W) -> Self {
        Self {
            out,
            table_header_written: false,
        }
    }

    /// Consume the reporter, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn title(&mut self, title: &str) -> io::Result<()> {
        writeln!(self.out, "{}", style(format!("=== {title} ===")).bold())
    }

    /// Header summary.
    pub fn file_info(&mut self, header: &ElfHeader) -> io::Result<()> {
        self.title("ELF File Information")?;
        writeln!(self.out, "Number of program headers: {}", header.phnum)?;
        writeln!(self.out, "Program header offset: 0x{:08x}", header.phoff)?;
        writeln!(self.out, "Entry point: 0x{:08x}", header.entry)?;
        writeln!(self.out)?;
        self.title("Program Headers")
    }

    /// One program header row, plus the mapping it will get if loadable.
    pub fn segment(&mut self, phdr: &ProgramHeader) -> io::Result<()> {
        if !self.table_header_written {
            writeln!(self.out, "{TABLE_HEADER}")?;
            self.table_header_written = true;
        }
        writeln!(
            self.out,
            "{:<14} 0x{:06x} 0x{:08x} 0x{:08x} 0x{:05x} 0x{:05x} {} 0x{:x}",
            phdr.kind.name(),
            phdr.offset,
            phdr.vaddr,
            phdr.paddr,
            phdr.filesz,
            phdr.memsz,
            phdr.flags,
            phdr.align,
        )?;
        if phdr.is_load() {
            writeln!(self.out, "  -> mmap mapping flags: MAP_PRIVATE | MAP_FIXED")?;
            let names = prot_names(prot_flags(phdr.flags));
            writeln!(self.out, "  -> mmap protection flags: {}", names.join(" "))?;
        }
        Ok(())
    }

    pub fn loading_title(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        self.title("Loading Program")
    }

    /// Announce a segment about to be mapped.
    pub fn loading(&mut self, phdr: &ProgramHeader) -> io::Result<()> {
        writeln!(
            self.out,
            "Loading segment: VirtAddr=0x{:08x}, Size=0x{:05x}, Flags={}",
            phdr.vaddr, phdr.memsz, phdr.flags
        )
    }

    pub fn mapped(&mut self, region: &MappedRegion) -> io::Result<()> {
        writeln!(self.out, "Successfully mapped segment at 0x{:08x}", region.base())
    }

    pub fn transfer(&mut self, entry: u32) -> io::Result<()> {
        writeln!(self.out)?;
        self.title("Transferring Control")?;
        writeln!(self.out, "Jumping to entry point: 0x{entry:08x}")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sld_elf::{SegmentFlags, SegmentKind};

    fn phdr(kind: SegmentKind, flags: SegmentFlags) -> ProgramHeader {
        ProgramHeader {
            kind,
            offset: 0,
            vaddr: 0x0001_0000,
            paddr: 0x0001_0000,
            filesz: 0x100,
            memsz: 0x200,
            flags,
            align: 0x1000,
        }
    }

    fn text(reporter: Reporter<Vec<u8>>) -> String {
        console::strip_ansi_codes(&String::from_utf8(reporter.into_inner()).unwrap()).into_owned()
    }

    #[test]
    fn test_load_row_format() {
        let mut reporter = Reporter::new(Vec::new());
        reporter
            .segment(&phdr(SegmentKind::Load, SegmentFlags::R | SegmentFlags::X))
            .unwrap();
        let out = text(reporter);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], TABLE_HEADER);
        assert_eq!(
            lines[1],
            "LOAD           0x000000 0x00010000 0x00010000 0x00100 0x00200 R E 0x1000"
        );
        assert_eq!(lines[2], "  -> mmap mapping flags: MAP_PRIVATE | MAP_FIXED");
        assert_eq!(lines[3], "  -> mmap protection flags: PROT_READ PROT_EXEC");
    }

    #[test]
    fn test_table_header_written_once() {
        let mut reporter = Reporter::new(Vec::new());
        reporter.segment(&phdr(SegmentKind::Note, SegmentFlags::R)).unwrap();
        reporter.segment(&phdr(SegmentKind::Tls, SegmentFlags::R)).unwrap();
        let out = text(reporter);
        assert_eq!(out.matches(TABLE_HEADER).count(), 1);
        assert!(!out.contains("mmap"));
        assert!(out.contains("\nTLS            "));
    }

    #[test]
    fn test_separate_reporters_do_not_share_state() {
        let mut first = Reporter::new(Vec::new());
        first.segment(&phdr(SegmentKind::Note, SegmentFlags::R)).unwrap();
        let mut second = Reporter::new(Vec::new());
        second.segment(&phdr(SegmentKind::Note, SegmentFlags::R)).unwrap();
        assert!(text(second).starts_with(TABLE_HEADER));
    }

    #[test]
    fn test_file_info_and_transfer() {
        let header = ElfHeader {
            class: 1,
            data: 1,
            version: 1,
            e_type: 2,
            machine: 3,
            entry: 0x0804_8054,
            phoff: 0x34,
            phentsize: 32,
            phnum: 2,
        };
        let mut reporter = Reporter::new(Vec::new());
        reporter.file_info(&header).unwrap();
        reporter.transfer(header.entry).unwrap();
        let out = text(reporter);
        assert!(out.starts_with("=== ELF File Information ===\n"));
        assert!(out.contains("Number of program headers: 2\n"));
        assert!(out.contains("Program header offset: 0x00000034\n"));
        assert!(out.contains("Entry point: 0x08048054\n"));
        assert!(out.contains("=== Program Headers ===\n"));
        assert!(out.ends_with("=== Transferring Control ===\nJumping to entry point: 0x08048054\n"));
    }
}
