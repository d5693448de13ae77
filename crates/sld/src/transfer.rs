//! Handing the CPU to a loaded image.
//!
//! The image expects the i386 System V process entry state: `esp` points at
//! `argc`, `edx` holds an exit handler (zero for none), and `ebp` is zero.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::startup::{StackError, StackImage, StartupInfo};

/// Size of the initial stack given to the image.
pub const DEFAULT_STACK_SIZE: u32 = 8 << 20;

/// Why control did not pass to the image.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cannot enter a 32-bit image on a {0} host")]
    UnsupportedHost(&'static str),

    #[error("failed to map the initial stack: {0}")]
    StackMap(#[from] nix::Error),

    #[error("initial stack at {0:#x} is not addressable by a 32-bit image")]
    StackOutOfRange(u64),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("{0}")]
    Declined(String),
}

/// Transfers control to an entry point.
///
/// Implementations that succeed never return, so the return value is always
/// the reason the transfer failed.
pub trait ControlTransfer {
    fn transfer(&mut self, entry: u32, startup: &StartupInfo) -> TransferError;
}

/// Jumps to the image on the current thread.
#[derive(Debug, Clone, Copy)]
pub struct NativeTransfer {
    stack_size: u32,
}

impl Default for NativeTransfer {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

impl NativeTransfer {
    #[must_use]
    pub const fn new(stack_size: u32) -> Self {
        Self { stack_size }
    }

    /// Map the stack below 4 GiB and fill it in. Returns the stack pointer.
    fn prepare_stack(&self, startup: &StartupInfo) -> Result<u32, TransferError> {
        let len = NonZeroUsize::new(self.stack_size as usize)
            .ok_or(StackError::TooLarge { needed: 1, available: 0 })?;

        // SAFETY: a fresh anonymous mapping aliases nothing.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | stack_flags(),
            )?
        };
        self.install_stack(base, len, startup)
    }

    /// Fill the stack mapped at `base`. The mapping is released if the
    /// startup data cannot be placed in it.
    fn install_stack(
        &self,
        base: NonNull<c_void>,
        len: NonZeroUsize,
        startup: &StartupInfo,
    ) -> Result<u32, TransferError> {
        let stack = match Self::stack_image(base.as_ptr() as u64, self.stack_size, startup) {
            Ok(stack) => stack,
            Err(e) => {
                // SAFETY: the caller handed over the mapping and nothing refers to it.
                if let Err(unmap) = unsafe { munmap(base, len.get()) } {
                    warn!(error = %unmap, "failed to unmap unused stack");
                }
                return Err(e);
            }
        };
        let bytes = stack.as_bytes();
        // SAFETY: [sp, top) lies inside the stack mapped at `base`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), stack.sp() as usize as *mut u8, bytes.len());
        }
        debug!(
            base = format_args!("{:#x}", base.as_ptr() as u64),
            sp = format_args!("{:#x}", stack.sp()),
            argc = startup.argc(),
            "initial stack ready"
        );
        Ok(stack.sp())
    }

    /// Lay out the stack for a mapping of `size` bytes at `base`.
    fn stack_image(base: u64, size: u32, startup: &StartupInfo) -> Result<StackImage, TransferError> {
        let top = u32::try_from(base + u64::from(size)).map_err(|_| TransferError::StackOutOfRange(base))?;
        Ok(StackImage::build(top, size, startup)?)
    }
}

impl ControlTransfer for NativeTransfer {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn transfer(&mut self, entry: u32, startup: &StartupInfo) -> TransferError {
        let sp = match self.prepare_stack(startup) {
            Ok(sp) => sp,
            Err(e) => return e,
        };
        info!(entry = format_args!("{entry:#010x}"), "entering image");
        // SAFETY: the image is mapped and its stack is in place. Nothing of
        // this process runs again unless the image returns into it, which the
        // entry ABI does not allow.
        unsafe { enter(entry, sp) }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    fn transfer(&mut self, _entry: u32, _startup: &StartupInfo) -> TransferError {
        TransferError::UnsupportedHost(std::env::consts::ARCH)
    }
}

#[cfg(target_arch = "x86_64")]
const fn stack_flags() -> MapFlags {
    MapFlags::MAP_32BIT
}

#[cfg(not(target_arch = "x86_64"))]
const fn stack_flags() -> MapFlags {
    MapFlags::MAP_STACK
}

#[cfg(target_arch = "x86")]
unsafe fn enter(entry: u32, sp: u32) -> ! {
    unsafe {
        core::arch::asm!(
            "mov esp, ecx",
            "xor edx, edx", // no exit handler
            "xor ebp, ebp", // outermost frame
            "jmp eax",
            in("eax") entry,
            in("ecx") sp,
            options(noreturn)
        );
    }
}

/// Far return into the 32-bit user code segment (compatibility mode).
#[cfg(target_arch = "x86_64")]
unsafe fn enter(entry: u32, sp: u32) -> ! {
    unsafe {
        core::arch::asm!(
            "mov eax, 0x2b", // __USER_DS
            "mov ds, ax",
            "mov es, ax",
            "mov esp, ecx",
            "xor edx, edx",
            "xor ebp, ebp",
            "push 0x23", // __USER32_CS
            "push rsi",
            "retfq",
            in("rsi") u64::from(entry),
            in("rcx") u64::from(sp),
            options(noreturn)
        );
    }
}

/// Records transfers instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingTransfer {
    pub calls: Vec<(u32, StartupInfo)>,
}

impl ControlTransfer for RecordingTransfer {
    fn transfer(&mut self, entry: u32, startup: &StartupInfo) -> TransferError {
        self.calls.push((entry, startup.clone()));
        TransferError::Declined(format!("transfer to {entry:#010x} recorded, not performed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_transfer_returns() {
        let mut transfer = RecordingTransfer::default();
        let startup = StartupInfo::new(vec!["a.out".into()], 0x0804_8054);
        let err = transfer.transfer(0x0804_8054, &startup);
        assert!(matches!(err, TransferError::Declined(_)));
        assert_eq!(transfer.calls.len(), 1);
        assert_eq!(transfer.calls[0].0, 0x0804_8054);
        assert_eq!(transfer.calls[0].1.args, startup.args);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_stack_below_4gib() {
        let transfer = NativeTransfer::new(1 << 16);
        let startup = StartupInfo::new(vec!["a.out".into(), "arg".into()], 0x1000);
        let sp = transfer.prepare_stack(&startup).unwrap();
        assert_eq!(sp % 16, 0);
        // SAFETY: sp points at argc inside the stack just prepared.
        let argc = unsafe { std::ptr::read(sp as usize as *const u32) };
        assert_eq!(argc, 2);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_stack_released_when_startup_does_not_fit() {
        let transfer = NativeTransfer::new(1 << 16);
        let len = NonZeroUsize::new(1 << 16).unwrap();
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | stack_flags(),
            )
            .unwrap()
        };
        let start = format!("{:x}-", base.as_ptr() as usize);
        let mapped = || {
            std::fs::read_to_string("/proc/self/maps")
                .unwrap()
                .lines()
                .any(|line| line.starts_with(&start))
        };
        assert!(mapped());

        let huge = "x".repeat(1 << 17);
        let startup = StartupInfo::new(vec!["a.out".into(), huge.into()], 0x1000);
        assert!(matches!(
            transfer.install_stack(base, len, &startup),
            Err(TransferError::Stack(StackError::TooLarge { .. }))
        ));
        assert!(!mapped());
    }

    #[test]
    fn test_zero_stack_rejected() {
        let transfer = NativeTransfer::new(0);
        let startup = StartupInfo::new(vec!["a.out".into()], 0x1000);
        assert!(matches!(
            transfer.prepare_stack(&startup),
            Err(TransferError::Stack(_))
        ));
    }
}
