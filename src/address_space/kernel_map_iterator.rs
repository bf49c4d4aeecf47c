use super::mapping::{MappedResource, Mapping, PseudoDevice, ResourceId};
use libc::{ino_t, pid_t};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    ffi::OsStr,
    fs::File,
    io::{BufRead, BufReader},
    os::unix::ffi::OsStrExt,
};

/// Iterator over the kernel's authoritative per-process map report,
/// /proc/<tid>/maps. Each line is parsed into an owned `Mapping` before
/// it is handed out, so the line buffer's lifetime never concerns
/// callers. The synthetic `[vsyscall]` entry is skipped: it lives in
/// kernel space and all address-range logic ignores it.
pub struct KernelMapIterator<R: BufRead> {
    tid: pid_t,
    buf_reader: R,
}

impl KernelMapIterator<BufReader<File>> {
    pub fn new_from_tid(tid: pid_t) -> KernelMapIterator<BufReader<File>> {
        let maps_path = format!("/proc/{}/maps", tid);
        match File::open(&maps_path) {
            Ok(file) => KernelMapIterator {
                tid,
                buf_reader: BufReader::new(file),
            },
            Err(e) => fatal!("Failed to open {}: {:?}", maps_path, e),
        }
    }
}

impl<R: BufRead> KernelMapIterator<R> {
    /// Parse a map report from an arbitrary reader. `tid` is used only
    /// for diagnostics.
    pub fn from_reader(tid: pid_t, reader: R) -> KernelMapIterator<R> {
        KernelMapIterator {
            tid,
            buf_reader: reader,
        }
    }

    /// Returns None for entries address-range logic must ignore.
    fn parse_rawline(&self, raw_line: &[u8]) -> Option<Mapping> {
        let mut line = raw_line;
        while let Some((&b'\n', rest)) = line.split_last() {
            line = rest;
        }

        let mut iter = line.splitn(6, |c| *c == b' ');
        let addr_range = String::from_utf8_lossy(self.scan(&mut iter, raw_line));
        let perms_s = String::from_utf8_lossy(self.scan(&mut iter, raw_line));
        let offset_s = String::from_utf8_lossy(self.scan(&mut iter, raw_line));
        let device = String::from_utf8_lossy(self.scan(&mut iter, raw_line));
        let inode_s = String::from_utf8_lossy(self.scan(&mut iter, raw_line));
        // The name column is padded with spaces and may be absent
        // entirely.
        let filename_unescaped: &[u8] = iter.next().unwrap_or(b"");

        let mut addr_iter = addr_range.split('-');
        let addr_low_s = self.scan_str(addr_iter.next(), raw_line);
        let addr_high_s = self.scan_str(addr_iter.next(), raw_line);

        let mut dev_iter = device.split(':');
        let dev_major_s = self.scan_str(dev_iter.next(), raw_line);
        let dev_minor_s = self.scan_str(dev_iter.next(), raw_line);

        let addr_low = self.scan_hex(addr_low_s, raw_line);
        let addr_high = self.scan_hex(addr_high_s, raw_line);
        let offset = self.scan_hex(&offset_s, raw_line);
        let dev_major = self.scan_hex(dev_major_s, raw_line);
        let dev_minor = self.scan_hex(dev_minor_s, raw_line);
        let inode: ino_t = match inode_s.parse::<ino_t>() {
            Ok(i) => i,
            Err(_) => fatal!("Failed to scan inode from {:?}", String::from_utf8_lossy(raw_line)),
        };

        let filename = unescape_filename(trim_leading_blanks(filename_unescaped));

        if filename == b"[vsyscall]" {
            return None;
        }
        let start = self.check_addr_bound(addr_low);
        let end = self.check_addr_bound(addr_high);

        Some(Mapping::from_range(
            start.into(),
            end.into(),
            get_prot(&perms_s),
            get_map_flags(&perms_s),
            offset,
            MappedResource::new(
                ResourceId::from_major_minor(dev_major, dev_minor, inode, PseudoDevice::None),
                OsStr::from_bytes(&filename),
            ),
        ))
    }

    fn scan<'a, I: Iterator<Item = &'a [u8]>>(&self, iter: &mut I, raw_line: &[u8]) -> &'a [u8] {
        match iter.next() {
            Some(s) => s,
            None => fatal!(
                "Failed to scan map line {:?}",
                String::from_utf8_lossy(raw_line)
            ),
        }
    }

    fn scan_str<'a>(&self, maybe: Option<&'a str>, raw_line: &[u8]) -> &'a str {
        match maybe {
            Some(s) => s,
            None => fatal!(
                "Failed to scan map line {:?}",
                String::from_utf8_lossy(raw_line)
            ),
        }
    }

    fn scan_hex(&self, s: &str, raw_line: &[u8]) -> u64 {
        match u64::from_str_radix(s, 16) {
            Ok(v) => v,
            Err(_) => fatal!(
                "Failed to scan {:?} from map line {:?}",
                s,
                String::from_utf8_lossy(raw_line)
            ),
        }
    }

    /// A 32-bit supervisor cannot model tracee addresses beyond 4 GiB.
    #[cfg(target_pointer_width = "32")]
    fn check_addr_bound(&self, val: u64) -> usize {
        if val > u32::max_value() as u64 {
            let exe = std::fs::read_link(format!("/proc/{}/exe", self.tid))
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "<unknown>".into());
            fatal!(
                "Tracee {} has 64-bit image {} and that's not supported with a 32-bit supervisor",
                self.tid,
                exe
            );
        }
        val as usize
    }

    #[cfg(target_pointer_width = "64")]
    fn check_addr_bound(&self, val: u64) -> usize {
        val as usize
    }
}

impl<R: BufRead> Iterator for KernelMapIterator<R> {
    type Item = Mapping;

    fn next(&mut self) -> Option<Mapping> {
        loop {
            let mut raw_line = Vec::new();
            match self.buf_reader.read_until(b'\n', &mut raw_line) {
                Ok(0) => return None,
                Ok(_) => {
                    if let Some(km) = self.parse_rawline(&raw_line) {
                        return Some(km);
                    }
                }
                Err(e) => fatal!("Error reading /proc/{}/maps: {:?}", self.tid, e),
            }
        }
    }
}

fn trim_leading_blanks(s: &[u8]) -> &[u8] {
    let mut start = 0;
    while start < s.len() && s[start] == b' ' {
        start += 1;
    }
    &s[start..]
}

/// /proc/<tid>/maps escapes newlines in filenames as "\012".
fn unescape_filename(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut iter = s.iter();
    while let Some(c) = iter.next() {
        if *c == b'\\' {
            let rest: &[u8] = iter.as_slice();
            if rest.starts_with(b"012") {
                out.push(b'\n');
                iter.nth(2);
                continue;
            }
        }
        out.push(*c);
    }
    out
}

fn get_prot(perms_s: &str) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if perms_s.contains('r') {
        prot |= ProtFlags::PROT_READ;
    }
    if perms_s.contains('w') {
        prot |= ProtFlags::PROT_WRITE;
    }
    if perms_s.contains('x') {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn get_map_flags(perms_s: &str) -> MapFlags {
    let mut map_flags = MapFlags::empty();
    if perms_s.contains('p') {
        map_flags |= MapFlags::MAP_PRIVATE;
    }
    if perms_s.contains('s') {
        map_flags |= MapFlags::MAP_SHARED;
    }
    map_flags
}
