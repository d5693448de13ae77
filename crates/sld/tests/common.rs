#![allow(dead_code)]

use std::io::Write;

use sld::PageSize;

pub fn page() -> PageSize {
    PageSize::host().expect("host page size")
}

pub fn page_u32() -> u32 {
    u32::try_from(page().get()).expect("page size fits in u32")
}

pub fn image_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(data).expect("write image");
    file.flush().expect("flush image");
    file
}

/// Permission column of the `/proc/self/maps` line starting at `base`.
pub fn mapping_perms(base: u64) -> Option<String> {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("read /proc/self/maps");
    let prefix = format!("{base:08x}-");
    maps.lines()
        .find(|line| line.starts_with(&prefix))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
}
