use crate::remote_ptr::{RemotePtr, Void};
use std::{
    cmp::{max, min, Ordering},
    fmt::{self, Display, Formatter},
    ops::{Deref, DerefMut},
};

/// A half-open range of tracee addresses. `end_` is excluded.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemoryRange {
    pub(crate) start_: RemotePtr<Void>,
    pub(crate) end_: RemotePtr<Void>,
}

impl Default for MemoryRange {
    fn default() -> Self {
        MemoryRange {
            start_: RemotePtr::null(),
            end_: RemotePtr::null(),
        }
    }
}

impl MemoryRange {
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }

    pub fn is_empty(&self) -> bool {
        self.start_ == self.end_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

/// BTreeMap key wrapper that makes "subset" lookups work: two keys whose
/// ranges intersect compare Equal, so probing with any sub-range of an
/// entry finds that entry. The map owner must keep entries disjoint or
/// the ordering stops being total.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRangeKey(pub MemoryRange);

impl PartialOrd for MemoryRangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if !self.0.intersects(&other.0) {
            // The Equal result of this start comparison handles probes
            // with an empty range sitting exactly at an entry's start.
            self.0.start_.cmp(&other.0.start_)
        } else {
            Ordering::Equal
        }
    }
}

impl PartialEq for MemoryRangeKey {
    fn eq(&self, other: &Self) -> bool {
        if !self.0.intersects(&other.0) {
            self.0.start_ == other.0.start_
        } else {
            true
        }
    }
}

impl Eq for MemoryRangeKey {}

impl Deref for MemoryRangeKey {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryRangeKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<MemoryRange> for MemoryRangeKey {
    fn from(r: MemoryRange) -> Self {
        MemoryRangeKey(r)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        collections::BTreeMap,
        ops::Bound::{Included, Unbounded},
    };

    fn key(start: usize, end: usize) -> MemoryRangeKey {
        MemoryRangeKey(MemoryRange::from_range(start.into(), end.into()))
    }

    #[test]
    fn containment_and_intersection() {
        let outer = MemoryRange::from_range(0x1000usize.into(), 0x4000usize.into());
        let inner = MemoryRange::from_range(0x2000usize.into(), 0x3000usize.into());
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.intersects(&inner));
        assert!(outer.contains_ptr(0x1000usize.into()));
        assert!(!outer.contains_ptr(0x4000usize.into()));
        assert_eq!(inner, outer.intersect(inner));
    }

    #[test]
    fn adjacent_ranges_do_not_intersect() {
        let lo = MemoryRange::from_range(0x1000usize.into(), 0x2000usize.into());
        let hi = MemoryRange::from_range(0x2000usize.into(), 0x3000usize.into());
        assert!(!lo.intersects(&hi));
    }

    #[test]
    fn overlapping_keys_compare_equal() {
        let mut m: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        m.insert(key(0, 10), 1);
        m.insert(key(10, 15), 2);
        m.insert(key(15, 20), 3);

        // A sub-range probe replaces the entry it overlaps.
        let replaced = m.insert(key(1, 10), 4);
        assert!(replaced.is_some());
        assert_eq!(3, m.len());
        assert_eq!(Some(&4), m.get(&key(1, 10)));

        // Probing with [9, 11) finds [0, 10) first in a forward range
        // query even though it also overlaps [10, 15).
        let probe = key(9, 11);
        let mut fwd = m.range((Included(probe), Unbounded));
        let (first, _) = fwd.next().unwrap();
        assert_eq!(0usize, first.start().as_usize());
        assert_eq!(10usize, first.end().as_usize());
        let (second, _) = fwd.next().unwrap();
        assert_eq!(10usize, second.start().as_usize());

        // Removal by overlapping probe peels entries one at a time.
        assert!(m.remove(&key(3, 11)).is_some());
        assert!(m.remove(&key(3, 11)).is_some());
        assert!(m.remove(&key(3, 11)).is_none());
        assert_eq!(1, m.len());
    }

    #[test]
    fn empty_probe_at_start_matches() {
        let mut m: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        m.insert(key(0x1000, 0x2000), 1);
        let probe = MemoryRangeKey(MemoryRange::from_range(
            0x1000usize.into(),
            0x1000usize.into(),
        ));
        let mut it = m.range((Included(probe), Unbounded));
        assert!(it.next().is_some());
    }
}
