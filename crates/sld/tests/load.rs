//! In-process loads of synthetic images.

mod common;

use std::num::NonZeroUsize;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use sld::{Error, LoadStage, Loader, MapError, Reporter};
use sld_elf::{ImageBuilder, SegmentFlags, SegmentSpec};

use common::{image_file, mapping_perms, page_u32};

#[test]
fn test_text_segment_with_zero_tail() {
    let vaddr = 0x0001_0000;
    let data = ImageBuilder::new(vaddr)
        .page_align(page_u32())
        .segment(
            SegmentSpec::load(vaddr, SegmentFlags::R | SegmentFlags::X)
                .code(&[0x90; 0x100])
                .bss(0x100),
        )
        .trailer(&[0xAA; 0x200])
        .build();
    let file = image_file(&data);

    let mut reporter = Reporter::new(Vec::new());
    let prepared = Loader::new(file.path(), Vec::new())
        .load(&mut reporter)
        .expect("load image");
    assert_eq!(prepared.entry, vaddr);

    let perms = mapping_perms(u64::from(vaddr)).expect("segment is mapped");
    assert_eq!(perms, "r-xp");

    // SAFETY: the segment was mapped readable just above.
    let bytes = unsafe { std::slice::from_raw_parts(vaddr as usize as *const u8, 0x200) };
    assert!(bytes[..0x100].iter().all(|&b| b == 0x90));
    assert!(bytes[0x100..].iter().all(|&b| b == 0));

    let report = String::from_utf8(reporter.into_inner()).unwrap();
    assert!(report.contains("LOAD           0x"));
    assert!(report.contains("  -> mmap protection flags: PROT_READ PROT_EXEC\n"));
    assert!(report.contains("Successfully mapped segment at 0x00010000\n"));

    // SAFETY: nothing from the image ran.
    unsafe { prepared.image.unmap().expect("unmap image") };
    assert_eq!(mapping_perms(u64::from(vaddr)), None);
}

#[test]
fn test_data_and_bss_segments() {
    let page = page_u32();
    let text = 0x3900_0000;
    let data_addr = text + 4 * page;
    let data = ImageBuilder::new(text)
        .page_align(page)
        .segment(SegmentSpec::load(text, SegmentFlags::R | SegmentFlags::X).code(&[0xC3; 0x20]))
        .segment(
            SegmentSpec::load(data_addr, SegmentFlags::R | SegmentFlags::W)
                .code(&[1, 2, 3, 4])
                .bss(2 * page),
        )
        .build();
    let file = image_file(&data);

    let prepared = Loader::new(file.path(), Vec::new())
        .load(&mut Reporter::silent())
        .expect("load image");
    let regions = prepared.image.regions();
    assert_eq!(regions.len(), 2);
    assert_eq!(mapping_perms(u64::from(text)).as_deref(), Some("r-xp"));
    assert_eq!(mapping_perms(u64::from(data_addr)).as_deref(), Some("rw-p"));

    // SAFETY: data segment is mapped read-write.
    let bss = unsafe {
        std::slice::from_raw_parts_mut(data_addr as usize as *mut u8, 4 + 2 * page as usize)
    };
    assert_eq!(&bss[..4], &[1, 2, 3, 4]);
    assert!(bss[4..].iter().all(|&b| b == 0));
    bss[4] = 0x55;

    // SAFETY: nothing from the image ran.
    unsafe { prepared.image.unmap().expect("unmap image") };
}

#[test]
fn test_occupied_address_rolls_back_whole_load() {
    let page = page_u32();
    let first = 0x3910_0000;
    let second = first + 8 * page;
    let third = second + 8 * page;
    let data = ImageBuilder::new(first)
        .page_align(page)
        .segment(SegmentSpec::load(first, SegmentFlags::R).code(&[1; 0x10]))
        .segment(SegmentSpec::load(second, SegmentFlags::R | SegmentFlags::W).code(&[2; 0x10]))
        .segment(SegmentSpec::load(third, SegmentFlags::R).code(&[3; 0x10]))
        .build();
    let file = image_file(&data);

    // SAFETY: MAP_FIXED_NOREPLACE does not disturb existing mappings.
    let blocker = unsafe {
        mmap_anonymous(
            NonZeroUsize::new(second as usize),
            NonZeroUsize::new(page as usize).unwrap(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED_NOREPLACE,
        )
        .expect("map blocker")
    };

    let mut reporter = Reporter::new(Vec::new());
    let err = Loader::new(file.path(), Vec::new())
        .load(&mut reporter)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Mapping(MapError::FixedAddressUnavailable(addr)) if addr == u64::from(second)
    ));
    assert_eq!(err.stage(), LoadStage::HeaderRead);

    let report = String::from_utf8(reporter.into_inner()).unwrap();
    assert_eq!(report.matches("Successfully mapped segment").count(), 1);
    assert!(report.contains(&format!("Successfully mapped segment at 0x{first:08x}")));
    assert!(!report.contains(&format!("VirtAddr=0x{third:08x}")));
    assert_eq!(mapping_perms(u64::from(first)), None, "first segment was rolled back");
    assert_eq!(mapping_perms(u64::from(second)).as_deref(), Some("r--p"), "blocker left alone");
    assert_eq!(mapping_perms(u64::from(third)), None, "third segment never mapped");

    // SAFETY: blocker was mapped above.
    unsafe { munmap(blocker, page as usize).expect("unmap blocker") };
}

#[test]
fn test_truncated_segment_maps_nothing() {
    let vaddr = 0x3920_0000;
    let mut data = ImageBuilder::new(vaddr)
        .page_align(page_u32())
        .segment(SegmentSpec::load(vaddr, SegmentFlags::R).code(&[7; 0x80]))
        .build();
    data.truncate(data.len() - 0x40);
    let file = image_file(&data);

    let err = Loader::new(file.path(), Vec::new())
        .load(&mut Reporter::silent())
        .unwrap_err();
    assert!(matches!(err, Error::Plan(MapError::SegmentBeyondFile { index: 0 })));
    assert_eq!(mapping_perms(u64::from(vaddr)), None);
}
