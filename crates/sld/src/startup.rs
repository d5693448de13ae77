//! Initial process stack for an i386 System V image.
//!
//! Layout, from the stack pointer upwards:
//!
//! ```text
//! sp -> argc
//!       argv[0] .. argv[argc-1], NULL
//!       envp[0] .. envp[n-1], NULL
//!       auxv pairs, AT_NULL
//!       (padding)
//!       AT_RANDOM bytes
//!       argument and environment strings
//! top
//! ```

use std::ffi::OsString;
use std::hash::{BuildHasher, Hasher, RandomState};
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;

pub const AT_NULL: u32 = 0;
pub const AT_PHDR: u32 = 3;
pub const AT_PHENT: u32 = 4;
pub const AT_PHNUM: u32 = 5;
pub const AT_PAGESZ: u32 = 6;
pub const AT_ENTRY: u32 = 9;
pub const AT_RANDOM: u32 = 25;

const WORD: u32 = 4;
const STACK_ALIGN: u32 = 16;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("initial stack needs {needed} bytes but only {available} are available")]
    TooLarge { needed: u64, available: u64 },
}

/// What the loaded image is told about itself at startup.
#[derive(Clone, Debug)]
pub struct StartupInfo {
    /// Argument vector; `args[0]` is the image path.
    pub args: Vec<OsString>,
    pub env: Vec<OsString>,
    pub entry: u32,
    /// Address of the mapped program header table, if known.
    pub phdr: Option<u32>,
    pub phent: u32,
    pub phnum: u32,
    pub page_size: u32,
    pub random: [u8; 16],
}

impl StartupInfo {
    /// Startup data with fresh `AT_RANDOM` bytes and an empty environment.
    #[must_use]
    pub fn new(args: Vec<OsString>, entry: u32) -> Self {
        Self {
            args,
            env: Vec::new(),
            entry,
            phdr: None,
            phent: 0,
            phnum: 0,
            page_size: 0,
            random: random_bytes(),
        }
    }

    #[must_use]
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    fn auxv(&self) -> Vec<(u32, u32)> {
        let mut auxv = Vec::with_capacity(7);
        if let Some(phdr) = self.phdr {
            auxv.push((AT_PHDR, phdr));
            auxv.push((AT_PHENT, self.phent));
            auxv.push((AT_PHNUM, self.phnum));
        }
        if self.page_size != 0 {
            auxv.push((AT_PAGESZ, self.page_size));
        }
        auxv.push((AT_ENTRY, self.entry));
        auxv
    }
}

/// 16 bytes from two randomly keyed SipHash states.
fn random_bytes() -> [u8; 16] {
    let mut out = [0u8; 16];
    for chunk in out.chunks_exact_mut(8) {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_usize(chunk.as_ptr() as usize);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

/// Serialised stack contents for the range `[sp, top)`.
#[derive(Clone, Debug)]
pub struct StackImage {
    bytes: Vec<u8>,
    sp: u32,
}

impl StackImage {
    /// Lay out `info` below `top`, using at most `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the layout does not fit.
    pub fn build(top: u32, capacity: u32, info: &StartupInfo) -> Result<Self, StackError> {
        let strings: u64 = info
            .args
            .iter()
            .chain(&info.env)
            .map(|s| s.as_bytes().len() as u64 + 1)
            .sum();
        let auxv = info.auxv();
        // argc, argv + NULL, envp + NULL, auxv pairs incl. AT_RANDOM and AT_NULL
        let words = 1 + (info.args.len() + 1) + (info.env.len() + 1) + 2 * (auxv.len() + 2);
        let needed = strings + 16 + u64::from(STACK_ALIGN) * 2 + words as u64 * u64::from(WORD);
        if needed > u64::from(capacity) || needed > u64::from(top) {
            return Err(StackError::TooLarge {
                needed,
                available: u64::from(capacity.min(top)),
            });
        }

        let mut writer = DownwardWriter::new(top);
        let mut argv = Vec::with_capacity(info.args.len());
        for arg in &info.args {
            argv.push(writer.push_str(arg.as_bytes()));
        }
        let mut envp = Vec::with_capacity(info.env.len());
        for var in &info.env {
            envp.push(writer.push_str(var.as_bytes()));
        }
        let random = writer.push_bytes(&info.random);

        let mut table = Vec::with_capacity(words);
        table.push(info.args.len() as u32);
        table.extend(&argv);
        table.push(0);
        table.extend(&envp);
        table.push(0);
        for (key, value) in auxv {
            table.extend([key, value]);
        }
        table.extend([AT_RANDOM, random]);
        table.extend([AT_NULL, 0]);

        let table_len = table.len() as u32 * WORD;
        writer.align_down(STACK_ALIGN);
        writer.skip_to((writer.cursor - table_len) & !(STACK_ALIGN - 1));
        let sp = writer.cursor;
        let mut at = sp;
        for word in table {
            writer.put_word(at, word);
            at += WORD;
        }

        Ok(Self {
            bytes: writer.finish(),
            sp,
        })
    }

    /// Initial stack pointer; points at `argc`.
    #[must_use]
    pub const fn sp(&self) -> u32 {
        self.sp
    }

    /// Bytes to place at `[sp, top)`.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Read the 32-bit word at address `addr`.
    #[must_use]
    pub fn word_at(&self, addr: u32) -> Option<u32> {
        let at = addr.checked_sub(self.sp)? as usize;
        let b = self.bytes.get(at..at + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read the NUL-terminated string at address `addr`.
    #[must_use]
    pub fn str_at(&self, addr: u32) -> Option<&[u8]> {
        let at = addr.checked_sub(self.sp)? as usize;
        let rest = self.bytes.get(at..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        Some(&rest[..end])
    }
}

/// Fills a buffer that grows down from `top`.
struct DownwardWriter {
    top: u32,
    cursor: u32,
    /// Bytes for `[cursor, top)` stored in reverse growth order.
    buf: Vec<u8>,
}

impl DownwardWriter {
    const fn new(top: u32) -> Self {
        Self {
            top,
            cursor: top,
            buf: Vec::new(),
        }
    }

    fn grow_to(&mut self, cursor: u32) {
        self.cursor = cursor;
        let len = (self.top - cursor) as usize;
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    fn index(&self, addr: u32) -> usize {
        (self.top - addr) as usize - 1
    }

    fn put_byte(&mut self, addr: u32, byte: u8) {
        let i = self.index(addr);
        self.buf[i] = byte;
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> u32 {
        let start = self.cursor - bytes.len() as u32;
        self.grow_to(start);
        for (i, &b) in bytes.iter().enumerate() {
            self.put_byte(start + i as u32, b);
        }
        start
    }

    fn push_str(&mut self, s: &[u8]) -> u32 {
        let start = self.push_bytes(&[0]);
        self.push_bytes(s);
        start - s.len() as u32
    }

    fn align_down(&mut self, align: u32) {
        self.grow_to(self.cursor & !(align - 1));
    }

    fn skip_to(&mut self, cursor: u32) {
        self.grow_to(cursor);
    }

    fn put_word(&mut self, addr: u32, word: u32) {
        for (i, b) in word.to_le_bytes().into_iter().enumerate() {
            self.put_byte(addr + i as u32, b);
        }
    }

    /// Bytes in ascending address order, starting at `cursor`.
    fn finish(mut self) -> Vec<u8> {
        self.buf.reverse();
        self.buf
    }
}
