//! Segment permission to page protection translation.

use nix::sys::mman::ProtFlags;
use sld_elf::SegmentFlags;

/// Translate `p_flags` into `mmap` protection bits.
///
/// Each missing permission bit withholds the matching protection.
#[must_use]
pub fn prot_flags(flags: SegmentFlags) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;
    if flags.is_readable() {
        prot |= ProtFlags::PROT_READ;
    }
    if flags.is_writable() {
        prot |= ProtFlags::PROT_WRITE;
    }
    if flags.is_executable() {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// Names of the protection bits set in `prot`, in R/W/X order.
#[must_use]
pub fn prot_names(prot: ProtFlags) -> Vec<&'static str> {
    [
        (ProtFlags::PROT_READ, "PROT_READ"),
        (ProtFlags::PROT_WRITE, "PROT_WRITE"),
        (ProtFlags::PROT_EXEC, "PROT_EXEC"),
    ]
    .into_iter()
    .filter(|(bit, _)| prot.contains(*bit))
    .map(|(_, name)| name)
    .collect()
}
