use super::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use std::{cmp::min, collections::HashMap};

/// NB: these random-looking enumeration values are chosen to match the
/// numbers programmed into x86 debug registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// A distinct watchpoint, corresponding to the information needed to
/// program a single x86 debug register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

bitflags! {
    struct RwxBits: u32 {
        const EXEC_BIT = 1 << 0;
        const READ_BIT = 1 << 1;
        const WRITE_BIT = 1 << 2;
        const READ_WRITE_BITS = Self::READ_BIT.bits | Self::WRITE_BIT.bits;
    }
}

/// Track the watched accesses of a contiguous range of memory addresses.
/// A record stays alive until all watched access types have been
/// cleared; each watchable access is refcounted separately.
#[derive(Clone)]
struct Watchpoint {
    exec_count: u32,
    read_count: u32,
    write_count: u32,
}

impl Watchpoint {
    fn new() -> Watchpoint {
        Watchpoint {
            exec_count: 0,
            read_count: 0,
            write_count: 0,
        }
    }

    fn watch(&mut self, which: RwxBits) {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count += 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count += 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count += 1;
        }
    }

    fn unwatch(&mut self, which: RwxBits) -> u32 {
        if which.contains(RwxBits::EXEC_BIT) {
            self.exec_count -= 1;
        }
        if which.contains(RwxBits::READ_BIT) {
            self.read_count -= 1;
        }
        if which.contains(RwxBits::WRITE_BIT) {
            self.write_count -= 1;
        }
        self.exec_count + self.read_count + self.write_count
    }

    fn watched_bits(&self) -> RwxBits {
        let mut watched = RwxBits::empty();
        if self.exec_count > 0 {
            watched |= RwxBits::EXEC_BIT;
        }
        if self.read_count > 0 {
            watched |= RwxBits::READ_BIT;
        }
        if self.write_count > 0 {
            watched |= RwxBits::WRITE_BIT;
        }
        watched
    }
}

/// Logical watch requests of one address space. The set is unbounded;
/// on every change the minimal hardware slot set realizing the union of
/// requests is re-derived, and the caller programs it into each
/// participant task's debug registers.
#[derive(Clone, Default)]
pub struct WatchpointRegistry {
    watchpoints: HashMap<MemoryRange, Watchpoint>,
}

impl WatchpointRegistry {
    pub fn new() -> WatchpointRegistry {
        WatchpointRegistry {
            watchpoints: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.watchpoints.is_empty()
    }

    /// Bump the counters of `type_` for `[addr, addr + num_bytes)`,
    /// creating the record if needed.
    pub fn watch(&mut self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        let range = range_for_watchpoint(addr, num_bytes);
        self.watchpoints
            .entry(range)
            .or_insert_with(Watchpoint::new)
            .watch(access_bits_of(type_));
    }

    /// Decrement the counters of `type_`; the record is dropped when all
    /// three reach zero. The counters must have been positive.
    pub fn unwatch(&mut self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        let range = range_for_watchpoint(addr, num_bytes);
        if let Some(wp) = self.watchpoints.get_mut(&range) {
            if wp.unwatch(access_bits_of(type_)) == 0 {
                self.watchpoints.remove(&range);
            }
        }
    }

    pub fn clear(&mut self) {
        self.watchpoints.clear();
    }

    /// Derive the hardware slots realizing the union of requests. Per
    /// record: one exec slot if the exec count is positive, one
    /// write-only slot iff only writes are watched, one read-write slot
    /// if reads are watched (the hardware cannot watch reads without
    /// writes). Slot order is not significant.
    pub fn get_watch_configs(&self) -> Vec<WatchConfig> {
        let mut regs: Vec<WatchConfig> = Vec::new();
        for (r, v) in self.watchpoints.iter() {
            let watching = v.watched_bits();
            if watching.contains(RwxBits::EXEC_BIT) {
                regs.push(WatchConfig::new(r.start(), r.size(), WatchType::WatchExec));
            }
            if watching.contains(RwxBits::READ_BIT) {
                regs.push(WatchConfig::new(
                    r.start(),
                    r.size(),
                    WatchType::WatchReadWrite,
                ));
            } else if watching.contains(RwxBits::WRITE_BIT) {
                regs.push(WatchConfig::new(r.start(), r.size(), WatchType::WatchWrite));
            }
        }
        regs
    }
}

/// Return the access bits needed to watch `type_`.
fn access_bits_of(type_: WatchType) -> RwxBits {
    match type_ {
        WatchType::WatchExec => RwxBits::EXEC_BIT,
        WatchType::WatchWrite => RwxBits::WRITE_BIT,
        WatchType::WatchReadWrite => RwxBits::READ_WRITE_BITS,
    }
}

/// We do not allow a watchpoint to watch the last byte of addressable
/// memory; that would construct a MemoryRange that wraps around. For
/// 64-bit builds addresses at the top of memory are kernel space; for
/// 32-bit builds the last page can't be mapped anyway.
fn range_for_watchpoint(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
    let max_len = std::usize::MAX - addr.as_usize();
    MemoryRange::new_range(addr, min(num_bytes, max_len))
}
