use super::{
    mapping::Mapping,
    mapping_table::try_merge_adjacent,
};
use crate::{
    log::LogLevel::LogError,
    task::Task,
    util::{find, EMUFS_PATH_FRAGMENTS},
};
use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

/// Checks that the shadow table matches the kernel's map report. Both
/// sides apply independent, only-very-slightly different heuristics for
/// merging adjacent mappings, so a byte-for-byte walk cannot work.
/// Instead both sides are reduced to the lowest common denominator that
/// can be parsed from the kernel report, adjacent segments are merged on
/// both sides under that lax projection, and the merged segments are
/// compared. The segments compared here may therefore look nothing like
/// either the kernel report or the shadow dump.
pub(super) struct VerifyAddressSpace {
    /// LCD projections of the shadow entries, in address order.
    shadow: Vec<Mapping>,
    /// Shadow dump kept for the mismatch diagnostic.
    space_dump: String,
    next: usize,
    /// Current merged shadow segment being matched.
    m: Option<Mapping>,
    /// Current merged kernel segment. Carries the merged shadow
    /// segment's resource, so kernel entries only merge while they stay
    /// equivalent to that one resource.
    km: Option<Mapping>,
    phase: Phase,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Phase {
    NoPhase,
    MergingCached,
    InitingKernel,
    MergingKernel,
}

impl VerifyAddressSpace {
    pub(super) fn new(shadow: Vec<Mapping>, space_dump: String) -> VerifyAddressSpace {
        VerifyAddressSpace {
            shadow,
            space_dump,
            next: 0,
            m: None,
            km: None,
            phase: Phase::NoPhase,
        }
    }

    /// Feed one kernel report entry, in canonical kernel order.
    pub(super) fn process_kernel_entry(&mut self, t: &dyn Task, kernel_m: Mapping) {
        if self.phase == Phase::NoPhase {
            ed_assert!(
                t,
                self.next < self.shadow.len(),
                "Kernel has segment {} but the shadow is exhausted",
                kernel_m
            );

            // Merge adjacent shadow entries.
            self.phase = Phase::MergingCached;
            let mut m = self.shadow[self.next].clone();
            self.next += 1;
            while self.next < self.shadow.len()
                && try_merge_adjacent(&mut m, &self.shadow[self.next])
            {
                self.next += 1;
            }
            self.m = Some(m);
            self.phase = Phase::InitingKernel;
        }

        if self.phase == Phase::InitingKernel {
            let r = self.m.as_ref().unwrap().resource().clone();
            // If the mapped file lives in the replayer's emulated
            // filesystem, the kernel reports the emulated file's system
            // device/inode, not the recorded pair the shadow carries.
            // Name containment is accepted there.
            ed_assert!(
                t,
                *kernel_m.resource() == r || is_emufs_name(kernel_m.fsname()),
                "Kernel segment {} maps a different resource than the shadow's {}",
                kernel_m,
                self.m.as_ref().unwrap()
            );
            self.km = Some(Mapping::from_range(
                kernel_m.start(),
                kernel_m.end(),
                kernel_m.prot(),
                kernel_m.flags(),
                kernel_m.file_offset_bytes(),
                r,
            ));
            self.phase = Phase::MergingKernel;
            return;
        }

        // Merge adjacent kernel entries, but only while they keep
        // mapping the merged shadow segment's resource.
        if self.phase == Phase::MergingKernel
            && try_merge_adjacent(self.km.as_mut().unwrap(), &kernel_m)
        {
            return;
        }

        // Merged as much as we can; now the segments must be equal.
        self.assert_segments_match(t);

        self.phase = Phase::NoPhase;
        self.process_kernel_entry(t, kernel_m);
    }

    /// Call after the last kernel entry has been fed.
    pub(super) fn finish(self, t: &dyn Task) {
        ed_assert!(
            t,
            self.phase == Phase::MergingKernel,
            "Kernel report ended prematurely"
        );
        self.assert_segments_match(t);
        ed_assert!(
            t,
            self.next == self.shadow.len(),
            "Shadow has segments the kernel doesn't, starting at {}",
            self.shadow[self.next]
        );
    }

    fn assert_segments_match(&self, t: &dyn Task) {
        let m = self.m.as_ref().unwrap();
        let km = self.km.as_ref().unwrap();
        let same_mapping = m.start() == km.start()
            && m.end() == km.end()
            && m.prot() == km.prot()
            && m.flags() == km.flags();
        if !same_mapping {
            log!(LogError, "cached mmap:\n{}", self.space_dump);
            ed_assert!(
                t,
                same_mapping,
                "\nCached mapping {} should be {}",
                m,
                km
            );
        }
    }
}

fn is_emufs_name(fsname: &OsStr) -> bool {
    EMUFS_PATH_FRAGMENTS
        .iter()
        .any(|fragment| find(fsname.as_bytes(), fragment).is_some())
}
