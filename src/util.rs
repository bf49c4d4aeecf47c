use nix::unistd::{sysconf, SysconfVar};
use std::convert::TryInto;

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap()
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size<T: Into<usize> + From<usize>>(size: T) -> T {
    ((size.into() + page_size() - 1) & !(page_size() - 1)).into()
}

pub fn floor_page_size<T: Into<usize> + From<usize>>(size: T) -> T {
    (size.into() & !(page_size() - 1)).into()
}

/// Byte-substring search. Returns the index of the first occurrence of
/// `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    for i in 0..=haystack.len() - needle.len() {
        if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// Placeholder files the recorder maps over holes in file-backed regions.
/// Adjacent mappings of these merge unconditionally.
pub const PREFIX_FOR_EMPTY_MMAPPED_REGIONS: &[u8] = b"/tmp/rewind-emptyfile-";

/// Where the replayer's emulated filesystem lives. A kernel-reported
/// fsname containing one of these fragments carries the *system*
/// device/inode of the emulated file, not the recorded one.
pub const EMUFS_PATH_FRAGMENTS: [&[u8]; 2] =
    [b"/dev/shm/rewind-emufs", b"/run/shm/rewind-emufs"];

/// Preload library that implements the syscall buffer inside the tracee.
pub const SYSCALLBUF_LIB_FILENAME: &[u8] = b"librewindpreload.so";
pub const SYSCALLBUF_LIB_FILENAME_32: &[u8] = b"librewindpreload_32.so";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_rounding() {
        let p = page_size();
        assert_eq!(0usize, ceil_page_size(0usize));
        assert_eq!(p, ceil_page_size(1usize));
        assert_eq!(p, ceil_page_size(p));
        assert_eq!(2 * p, ceil_page_size(p + 1));
        assert_eq!(0usize, floor_page_size(p - 1));
        assert_eq!(p, floor_page_size(p + 1));
    }

    #[test]
    fn byte_search() {
        assert_eq!(Some(0), find(b"abc", b"a"));
        assert_eq!(Some(5), find(b"/lib/libc.so.6", b"libc"));
        assert_eq!(None, find(b"abc", b"abcd"));
        assert_eq!(Some(0), find(b"abc", b""));
    }
}
