use super::{
    mapping::{MappedResource, Mapping},
    memory_range::{MemoryRange, MemoryRangeKey},
};
use crate::{
    log::LogLevel::LogDebug,
    remote_ptr::{RemotePtr, Void},
    util::{ceil_page_size, floor_page_size, PREFIX_FOR_EMPTY_MMAPPED_REGIONS},
};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    cmp::min,
    collections::BTreeMap,
    ops::Bound::{Included, Unbounded},
    os::unix::ffi::OsStrExt,
};

pub type MemoryMap = BTreeMap<MemoryRangeKey, Mapping>;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum IterateHow {
    IterateDefault,
    /// Stop at the first gap after the first mapping hit.
    IterateContiguous,
}

/// The ordered set of mappings of one address space. Entries never
/// overlap; mutations split and re-coalesce entries the way the kernel
/// does so the table stays matchable against the kernel's map report.
#[derive(Clone, Default)]
pub struct MappingTable {
    mem: MemoryMap,
}

impl MappingTable {
    pub fn new() -> MappingTable {
        MappingTable {
            mem: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// All entries, in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mem.values()
    }

    pub fn get(&self, key: MemoryRangeKey) -> Option<&Mapping> {
        self.mem.get(&key)
    }

    /// The entry containing the byte at `addr`, if any.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<&Mapping> {
        // A 1-byte probe compares Equal to any entry containing `addr`.
        let probe = MemoryRangeKey(MemoryRange::new_range(addr, 1));
        match self.mem.get(&probe) {
            Some(m) if m.contains_ptr(addr) => Some(m),
            _ => None,
        }
    }

    /// Record a new mapping of `num_bytes` at `addr`, evicting whatever
    /// overlapped it, and coalesce around the insertion.
    pub fn map(
        &mut self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset_bytes: u64,
        res: MappedResource,
    ) -> Mapping {
        log!(
            LogDebug,
            "mmap({}, {:#x}, {:?}, {:?}, {:#x})",
            addr,
            num_bytes,
            prot,
            flags,
            offset_bytes
        );
        let num_bytes = ceil_page_size(num_bytes);
        debug_assert!(num_bytes > 0);

        let m = Mapping::new(addr, num_bytes, prot, flags, offset_bytes, res);

        // The mmap() man page doesn't specifically describe what should
        // happen if an existing map is "overwritten" by a new map (of
        // the same resource). In testing, the behavior seems to be as
        // if the overlapping region is unmapped and then remapped per
        // the arguments to the second call.
        self.unmap(addr, num_bytes);

        self.map_and_coalesce(m.clone());
        m
    }

    /// Drop `[addr, addr + num_bytes)` from the table, re-inserting the
    /// fragments of partially covered entries.
    pub fn unmap(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        log!(LogDebug, "munmap({}, {:#x})", addr, num_bytes);
        let num_bytes = ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return;
        }

        self.for_each_in_range(
            addr,
            num_bytes,
            |slf, m_key, rem| {
                let m = slf.mem.get(&m_key).unwrap().clone();
                slf.mem.remove(&m_key);
                log!(LogDebug, "  erased ({})", m);

                // If the first entry we unmap underflows the unmap
                // region, remap the underflow region.
                if m.start() < rem.start() {
                    slf.add_to_map(m.subrange(m.start(), rem.start()));
                }
                // If the last entry we unmap overflows the unmap
                // region, remap the overflow region.
                if rem.end() < m.end() {
                    slf.add_to_map(m.subrange(rem.end(), m.end()));
                }
            },
            IterateHow::IterateDefault,
        );
    }

    /// Change the protection of `[addr, addr + num_bytes)` to `prot`.
    /// Only the contiguous run of entries starting at `addr` is walked.
    pub fn protect(&mut self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        log!(LogDebug, "mprotect({}, {:#x}, {:?})", addr, num_bytes, prot);

        let new_prot = prot & (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC);
        let mut last_overlap: Option<MemoryRangeKey> = None;
        self.for_each_in_range(
            addr,
            num_bytes,
            |slf, m_key, rem| {
                let m = slf.mem.get(&m_key).unwrap().clone();
                log!(LogDebug, "  protecting ({}) ...", rem);
                slf.mem.remove(&m_key);

                // If the first entry we protect underflows the region,
                // remap the underflow region with the previous prot.
                if m.start() < rem.start() {
                    slf.add_to_map(m.subrange(m.start(), rem.start()));
                }
                // Remap the overlapping region with the new prot.
                let new_end = min(rem.end(), m.end());
                let overlap = m.subrange(rem.start(), new_end).set_prot(new_prot);
                last_overlap = Some(MemoryRangeKey(*overlap));
                slf.add_to_map(overlap);

                // If the last entry we protect overflows the region,
                // remap the overflow region with the previous prot.
                if rem.end() < m.end() {
                    slf.add_to_map(m.subrange(rem.end(), m.end()));
                }
            },
            IterateHow::IterateContiguous,
        );
        // Every entry we altered that might need coalescing is adjacent
        // to the last overlap slice.
        if let Some(last_overlap_key) = last_overlap {
            self.coalesce_around(last_overlap_key);
        }
    }

    /// Move `[old_addr, old_addr + old_num_bytes)` to
    /// `[new_addr, new_addr + new_num_bytes)`, preserving metadata.
    /// Exactly one entry must cover the old range.
    pub fn remap(
        &mut self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        log!(
            LogDebug,
            "mremap({}, {:#x}, {}, {:#x})",
            old_addr,
            old_num_bytes,
            new_addr,
            new_num_bytes
        );
        let old_num_bytes = ceil_page_size(old_num_bytes);

        let m = match self.mapping_of(old_addr) {
            Some(m) => m.clone(),
            None => fatal!("mremap of unmapped address {}", old_addr),
        };
        debug_assert!(m.contains(&MemoryRange::new_range(old_addr, old_num_bytes)));
        let km = m.subrange(old_addr, min(m.end(), old_addr + old_num_bytes));

        self.unmap(old_addr, old_num_bytes);
        if new_num_bytes == 0 {
            return;
        }
        let new_num_bytes = ceil_page_size(new_num_bytes);

        // A fixed destination evicts whatever was there.
        self.unmap(new_addr, new_num_bytes);
        self.map_and_coalesce(km.set_range(new_addr, new_addr + new_num_bytes));
    }

    /// For each entry overlapping `[addr, addr + num_bytes)`, call `f`
    /// with the entry's key and the range of addresses remaining to be
    /// iterated over. `f` is allowed to erase and insert entries.
    pub fn for_each_in_range<F: FnMut(&mut Self, MemoryRangeKey, MemoryRange)>(
        &mut self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        mut f: F,
        how: IterateHow,
    ) {
        let region_start = floor_page_size(addr);
        let region_end = ceil_page_size(addr + num_bytes);
        let mut last_f_mapped_end = region_start;
        while last_f_mapped_end < region_end {
            // Invariant: `rem` is always exactly the region of memory
            // remaining to be examined.
            let rem = MemoryRange::from_range(last_f_mapped_end, region_end);

            // The next entry to iterate may not be contiguous with the
            // last one seen.
            let probe = MemoryRangeKey(MemoryRange::new_range(rem.start(), 1));
            let range = match self.mem.range((Included(probe), Unbounded)).next() {
                Some((r, _)) => *r,
                None => {
                    log!(LogDebug, "  not found, done.");
                    return;
                }
            };
            if rem.end() <= range.start() {
                log!(LogDebug, "  mapping at {} out of range, done.", range.start());
                return;
            }
            // range.start() < region_start can only happen for the
            // first entry iterated.
            if IterateHow::IterateContiguous == how
                && !(range.start() < region_start || rem.start() == range.start())
            {
                log!(LogDebug, "  discontiguous mapping at {}, done.", range.start());
                return;
            }

            f(self, range, rem);

            // Maintain the loop invariant.
            last_f_mapped_end = range.end();
        }
    }

    /// Insert `m` and merge it with any semantically adjacent neighbors.
    pub fn map_and_coalesce(&mut self, m: Mapping) {
        log!(LogDebug, "  mapping {}", m);
        let key = MemoryRangeKey(*m);
        let result = self.mem.insert(key, m);
        debug_assert!(result.is_none());
        self.coalesce_around(key);
    }

    /// Walk left then right from the entry at `key`, merging neighbors
    /// while the adjacency predicate holds, and replace the merged run
    /// with one entry.
    pub fn coalesce_around(&mut self, key: MemoryRangeKey) {
        let new_m: Mapping;
        let first_k: MemoryRangeKey;
        let last_k: MemoryRangeKey;

        {
            let mut forward = self.mem.range((Included(key), Unbounded));
            let mut backward = self.mem.range((Unbounded, Included(key)));

            let mut first_kv = backward.next_back().unwrap();
            while let Some(prev_kv) = backward.next_back() {
                if !is_adjacent_mapping(prev_kv.1, first_kv.1) {
                    break;
                }
                first_kv = prev_kv;
            }
            let mut last_kv = forward.next().unwrap();
            while let Some(next_kv) = forward.next() {
                if !is_adjacent_mapping(last_kv.1, next_kv.1) {
                    break;
                }
                last_kv = next_kv;
            }

            if first_kv.0 == last_kv.0 {
                log!(LogDebug, "  no mappings to coalesce");
                return;
            }

            new_m = first_kv.1.extend(last_kv.0.end());
            log!(LogDebug, "  coalescing {}", new_m);
            first_k = *first_kv.0;
            last_k = *last_kv.0;
        }

        let to_remove: Vec<MemoryRangeKey> = self
            .mem
            .range((Included(first_k), Included(last_k)))
            .map(|(k, _)| *k)
            .collect();
        for k in to_remove {
            self.mem.remove(&k);
        }

        let key = MemoryRangeKey(*new_m);
        let result = self.mem.insert(key, new_m);
        debug_assert!(result.is_none());
    }

    fn add_to_map(&mut self, m: Mapping) {
        if m.is_empty() {
            return;
        }
        self.mem.insert(MemoryRangeKey(*m), m);
    }
}

/// Return true iff `left` and `right` are located adjacently in memory
/// with the same metadata, and map adjacent locations of the same
/// underlying (real) device.
pub fn is_adjacent_mapping(left: &Mapping, right: &Mapping) -> bool {
    if left.end() != right.start() {
        return false;
    }
    if left.flags() != right.flags() || left.prot() != right.prot() {
        return false;
    }
    // Placeholder regions mapped over holes merge into whatever
    // precedes them, whatever their resource says.
    if right
        .fsname()
        .as_bytes()
        .starts_with(PREFIX_FOR_EMPTY_MMAPPED_REGIONS)
    {
        return true;
    }
    if left.resource() != right.resource() {
        return false;
    }
    if left.is_real_device()
        && left.file_offset_bytes() + left.size() as u64 != right.file_offset_bytes()
    {
        return false;
    }
    true
}

/// If `left` and `right` are adjacent per `is_adjacent_mapping`, write a
/// merged descriptor to `left` and return true.
pub fn try_merge_adjacent(left: &mut Mapping, right: &Mapping) -> bool {
    if is_adjacent_mapping(left, right) {
        *left = left.extend(right.end());
        return true;
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address_space::mapping::{PseudoDevice, ResourceId};
    use crate::util::page_size;
    use std::ffi::OsStr;

    fn rw() -> ProtFlags {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    }

    fn anon_flags() -> MapFlags {
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS
    }

    fn file_res(inode: u64) -> MappedResource {
        MappedResource::new(
            ResourceId::from_major_minor(8, 1, inode, PseudoDevice::None),
            OsStr::new("/lib/libfoo.so"),
        )
    }

    fn assert_no_overlap(table: &MappingTable) {
        let entries: Vec<MemoryRange> = table.iter().map(|m| **m).collect();
        for w in entries.windows(2) {
            assert!(w[0].end() <= w[1].start(), "{} overlaps {}", w[0], w[1]);
        }
    }

    fn entries(table: &MappingTable) -> Vec<(usize, usize, ProtFlags)> {
        table
            .iter()
            .map(|m| (m.start().as_usize(), m.end().as_usize(), m.prot()))
            .collect()
    }

    #[test]
    fn split_on_partial_unmap() {
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x4000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.unmap(0x2000usize.into(), 0x1000);

        assert_eq!(
            vec![(0x1000, 0x2000, rw()), (0x3000, 0x5000, rw())],
            entries(&t)
        );
        assert_eq!(0, t.iter().map(|m| m.file_offset_bytes()).max().unwrap());
        assert_no_overlap(&t);
        assert!(t.mapping_of(0x2000usize.into()).is_none());
        assert!(t.mapping_of(0x1fffusize.into()).is_some());
        assert!(t.mapping_of(0x3000usize.into()).is_some());
    }

    #[test]
    fn protect_middle_then_coalesce_back() {
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x3000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.protect(0x2000usize.into(), 0x1000, ProtFlags::PROT_READ);
        assert_eq!(
            vec![
                (0x1000, 0x2000, rw()),
                (0x2000, 0x3000, ProtFlags::PROT_READ),
                (0x3000, 0x4000, rw()),
            ],
            entries(&t)
        );
        assert_no_overlap(&t);

        // Restoring the protection merges the three slices back into
        // one entry: the fragments still share one anonymous resource.
        t.protect(0x2000usize.into(), 0x1000, rw());
        assert_eq!(vec![(0x1000, 0x4000, rw())], entries(&t));
    }

    #[test]
    fn independent_anonymous_maps_never_merge() {
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.map(
            0x2000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        assert_eq!(2, t.len());
    }

    #[test]
    fn adjacent_file_pieces_with_contiguous_offsets_merge() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(42),
        );
        t.map(
            (0x1000 + p).into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            p as u64,
            file_res(42),
        );
        assert_eq!(1, t.len());
        let m = t.mapping_of(0x1000usize.into()).unwrap();
        assert_eq!(0x1000 + 2 * p, m.end().as_usize());
        assert_eq!(0, m.file_offset_bytes());
    }

    #[test]
    fn file_pieces_with_discontiguous_offsets_stay_split() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(42),
        );
        t.map(
            (0x1000 + p).into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            3 * p as u64,
            file_res(42),
        );
        assert_eq!(2, t.len());
    }

    #[test]
    fn placeholder_regions_force_merge() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(42),
        );
        let placeholder = MappedResource::new(
            ResourceId::from_major_minor(0, 19, 999, PseudoDevice::None),
            OsStr::new("/tmp/rewind-emptyfile-17"),
        );
        t.map(
            (0x1000 + p).into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            placeholder,
        );
        assert_eq!(1, t.len());
    }

    #[test]
    fn mmap_over_existing_is_unmap_then_map() {
        // The kernel's behavior for overlapping maps of the same
        // resource is undocumented; we implement what it was observed
        // to do: unmap the overlap, then map afresh.
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x3000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.map(
            0x2000usize.into(),
            0x1000,
            ProtFlags::PROT_READ,
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        assert_eq!(
            vec![
                (0x1000, 0x2000, rw()),
                (0x2000, 0x3000, ProtFlags::PROT_READ),
                (0x3000, 0x4000, rw()),
            ],
            entries(&t)
        );
        assert_no_overlap(&t);
    }

    #[test]
    fn remap_preserves_metadata_and_adjusts_offset() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            4 * p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0x10000,
            file_res(42),
        );
        // Move the second page somewhere else, twice as large.
        t.remap((0x1000 + p).into(), p, 0x100000usize.into(), 2 * p);

        let moved = t.mapping_of(0x100000usize.into()).unwrap();
        assert_eq!(0x100000 + 2 * p, moved.end().as_usize());
        assert_eq!(ProtFlags::PROT_READ, moved.prot());
        assert_eq!(0x10000 + p as u64, moved.file_offset_bytes());
        assert!(t.mapping_of((0x1000 + p).into()).is_none());
        assert_no_overlap(&t);
    }

    #[test]
    fn remap_to_zero_length_just_unmaps() {
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.remap(0x1000usize.into(), 0x1000, 0x5000usize.into(), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn protect_stops_at_discontiguity() {
        let mut t = MappingTable::new();
        let res = MappedResource::anonymous();
        t.map(0x1000usize.into(), 0x1000, rw(), anon_flags(), 0, res);
        t.map(
            0x3000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        // The walk covers [0x1000, 0x4000) but must stop at the hole at
        // 0x2000, leaving the entry at 0x3000 untouched.
        t.protect(0x1000usize.into(), 0x3000, ProtFlags::PROT_READ);
        assert_eq!(
            vec![(0x1000, 0x2000, ProtFlags::PROT_READ), (0x3000, 0x4000, rw())],
            entries(&t)
        );
    }

    #[test]
    fn unmap_spanning_gap_removes_both_sides() {
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.map(
            0x3000usize.into(),
            0x1000,
            rw(),
            anon_flags(),
            0,
            MappedResource::anonymous(),
        );
        t.unmap(0x1000usize.into(), 0x3000);
        assert!(t.is_empty());
    }

    #[test]
    fn unmap_then_identical_map_restores_entry() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            2 * p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(7),
        );
        t.unmap(0x1000usize.into(), 2 * p);
        t.map(
            0x1000usize.into(),
            2 * p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(7),
        );
        assert_eq!(1, t.len());
        let m = t.mapping_of(0x1000usize.into()).unwrap();
        assert_eq!(0x1000 + 2 * p, m.end().as_usize());
        assert_eq!(0, m.file_offset_bytes());
    }

    #[test]
    fn coalesce_around_is_idempotent() {
        let p = page_size();
        let mut t = MappingTable::new();
        t.map(
            0x1000usize.into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
            file_res(42),
        );
        t.map(
            (0x1000 + p).into(),
            p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            p as u64,
            file_res(42),
        );
        let before = entries(&t);
        let key = MemoryRangeKey(**t.mapping_of(0x1000usize.into()).unwrap());
        t.coalesce_around(key);
        assert_eq!(before, entries(&t));
    }
}
