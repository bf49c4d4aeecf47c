use super::memory_range::MemoryRange;
use crate::{
    remote_ptr::{RemotePtr, Void},
    util::{ceil_page_size, page_size},
};
use libc::{dev_t, ino_t, pid_t, MAP_ANONYMOUS, MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MAP_STACK};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::{major, makedev, minor},
};
use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

/// Pseudo-devices aren't real disk devices, but they differentiate
/// memory mappings when we're deciding whether adjacent device-less
/// mappings should be coalesced.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PseudoDevice {
    None,
    Anonymous,
    Heap,
    Scratch,
    SharedMmapFile,
    Stack,
    Syscallbuf,
    Vdso,
}

impl PseudoDevice {
    /// The tag appended to dump lines. Matches the kernel-report style
    /// markers the rest of the tooling greps for.
    pub fn special_name(self) -> &'static str {
        match self {
            PseudoDevice::None | PseudoDevice::Anonymous | PseudoDevice::Scratch => "",
            PseudoDevice::Heap => "(heap)",
            PseudoDevice::SharedMmapFile => "(shmmap)",
            PseudoDevice::Stack => "(stack)",
            PseudoDevice::Syscallbuf => "(syscallbuf)",
            PseudoDevice::Vdso => "(vdso)",
        }
    }
}

/// Identifies the resource backing a mapping: a (device, inode) pair for
/// file-backed regions, or a pseudo-device tag for synthetic ones.
/// Anonymous resources carry a synthetic inode so that two independent
/// anonymous allocations never alias.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceId {
    device: dev_t,
    inode: ino_t,
    psdev: PseudoDevice,
}

static NR_ANONYMOUS_MAPS: AtomicU64 = AtomicU64::new(0);

impl ResourceId {
    pub const NO_DEVICE: dev_t = 0;
    pub const NO_INODE: ino_t = 0;

    pub fn new(device: dev_t, inode: ino_t, psdev: PseudoDevice) -> ResourceId {
        ResourceId {
            device,
            inode,
            psdev,
        }
    }

    pub fn pseudo_only(psdev: PseudoDevice) -> ResourceId {
        ResourceId::new(Self::NO_DEVICE, Self::NO_INODE, psdev)
    }

    pub fn from_major_minor(
        dev_major: u64,
        dev_minor: u64,
        inode: ino_t,
        psdev: PseudoDevice,
    ) -> ResourceId {
        ResourceId::new(makedev(dev_major, dev_minor), inode, psdev)
    }

    /// Return true if this file is/was backed by an external device, as
    /// opposed to a transient RAM mapping.
    pub fn is_real_device(&self) -> bool {
        self.device > Self::NO_DEVICE
    }

    pub fn dev_major(&self) -> u64 {
        if self.is_real_device() {
            major(self.device)
        } else {
            0
        }
    }

    pub fn dev_minor(&self) -> u64 {
        if self.is_real_device() {
            minor(self.device)
        } else {
            0
        }
    }

    /// A displayable "real" inode; 0 for pseudo-devices.
    pub fn disp_inode(&self) -> ino_t {
        if self.is_real_device() {
            self.inode
        } else {
            0
        }
    }

    pub fn psdev(&self) -> PseudoDevice {
        self.psdev
    }

    pub fn inode(&self) -> ino_t {
        self.inode
    }

    /// Return true iff `self` and `o` are the same "real device" (same
    /// device and inode), or both are ANONYMOUS pseudo-devices. Results
    /// are undefined for other pseudo-devices.
    pub fn equivalent_to(&self, o: &ResourceId) -> bool {
        if self.psdev != o.psdev {
            return false;
        }
        if self.psdev == PseudoDevice::Anonymous {
            return true;
        }
        if self.dev_major() != o.dev_major() {
            return false;
        }
        // Device minor numbers may vary when the major is 0: some
        // kernels report unstable minors for virtual filesystems.
        if self.dev_major() != 0 && self.dev_minor() != o.dev_minor() {
            return false;
        }
        self.inode == o.inode
    }
}

/// A resource that can be mapped into the tracee, plus some name it may
/// have on its underlying filesystem. The name is used only for
/// labelling mapped segments, preload-library matching and dump output.
#[derive(Clone, Debug)]
pub struct MappedResource {
    pub id: ResourceId,
    pub fsname: OsString,
}

impl MappedResource {
    pub fn new(id: ResourceId, fsname: &OsStr) -> MappedResource {
        MappedResource {
            id,
            fsname: fsname.to_owned(),
        }
    }

    pub fn anonymous() -> MappedResource {
        let inode = NR_ANONYMOUS_MAPS.fetch_add(1, Ordering::SeqCst);
        MappedResource::new(
            ResourceId::new(ResourceId::NO_DEVICE, inode, PseudoDevice::Anonymous),
            OsStr::new(""),
        )
    }

    pub fn heap() -> MappedResource {
        MappedResource::new(
            ResourceId::pseudo_only(PseudoDevice::Heap),
            OsStr::new("[heap]"),
        )
    }

    pub fn stack(tid: pid_t) -> MappedResource {
        MappedResource::new(
            ResourceId::new(ResourceId::NO_DEVICE, tid as ino_t, PseudoDevice::Stack),
            OsStr::new("[stack]"),
        )
    }

    pub fn scratch(tid: pid_t) -> MappedResource {
        MappedResource::new(
            ResourceId::new(ResourceId::NO_DEVICE, tid as ino_t, PseudoDevice::Scratch),
            OsStr::new("[scratch]"),
        )
    }

    pub fn vdso() -> MappedResource {
        MappedResource::new(
            ResourceId::pseudo_only(PseudoDevice::Vdso),
            OsStr::new("[vdso]"),
        )
    }

    pub fn shared_mmap_file(device: dev_t, inode: ino_t, fsname: &OsStr) -> MappedResource {
        MappedResource::new(
            ResourceId::new(device, inode, PseudoDevice::SharedMmapFile),
            fsname,
        )
    }

    pub fn syscallbuf(device: dev_t, inode: ino_t, path: &OsStr) -> MappedResource {
        MappedResource::new(ResourceId::new(device, inode, PseudoDevice::Syscallbuf), path)
    }

    pub fn is_stack(&self) -> bool {
        self.id.psdev() == PseudoDevice::Stack
    }

    pub fn is_scratch(&self) -> bool {
        self.id.psdev() == PseudoDevice::Scratch
    }

    pub fn is_shared_mmap_file(&self) -> bool {
        self.id.psdev() == PseudoDevice::SharedMmapFile
    }

    /// The representation of this resource that would be parsed from the
    /// kernel's map report if this were mapped: real device numbers
    /// only, pseudo information dropped.
    pub fn to_kernel(&self) -> MappedResource {
        MappedResource::new(
            ResourceId::from_major_minor(
                self.id.dev_major(),
                self.id.dev_minor(),
                self.id.disp_inode(),
                PseudoDevice::None,
            ),
            &self.fsname,
        )
    }
}

impl PartialEq for MappedResource {
    fn eq(&self, o: &MappedResource) -> bool {
        self.id.equivalent_to(&o.id)
    }
}

impl Display for MappedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x} {:<10} {} {}",
            self.id.dev_major(),
            self.id.dev_minor(),
            self.id.disp_inode(),
            self.fsname.to_string_lossy(),
            self.id.psdev().special_name()
        )
    }
}

/// One entry of the shadow map: a page-aligned range with protection,
/// flag and offset metadata, bound to the resource backing it.
#[derive(Debug)]
pub struct Mapping {
    mr: MemoryRange,
    prot: ProtFlags,
    flags: MapFlags,
    offset: u64,
    res: MappedResource,
}

impl Mapping {
    /// These are the flags we track internally to distinguish between
    /// adjacent segments. For example, the kernel considers a NORESERVE
    /// anonymous mapping that's adjacent to a non-NORESERVE mapping
    /// distinct, even if all other metadata are the same.
    pub const MAP_FLAGS_MASK: MapFlags = MapFlags::from_bits_truncate(
        MAP_ANONYMOUS | MAP_NORESERVE | MAP_PRIVATE | MAP_SHARED | MAP_STACK,
    );
    /// The only flags the kernel's map report can tell us about.
    pub const CHECKABLE_FLAGS_MASK: MapFlags =
        MapFlags::from_bits_truncate(MAP_PRIVATE | MAP_SHARED);

    pub fn new(
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
        res: MappedResource,
    ) -> Mapping {
        Self::from_range(addr, addr + ceil_page_size(num_bytes), prot, flags, offset, res)
    }

    pub fn from_range(
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
        res: MappedResource,
    ) -> Mapping {
        let result = Mapping {
            mr: MemoryRange::from_range(start, end),
            prot,
            flags: flags & Self::MAP_FLAGS_MASK,
            offset,
            res,
        };
        result.assert_valid();
        result
    }

    pub fn assert_valid(&self) {
        debug_assert!(self.mr.end() >= self.mr.start());
        debug_assert_eq!(self.mr.size() % page_size(), 0);
        debug_assert!((self.flags & !Self::MAP_FLAGS_MASK).is_empty());
        debug_assert_eq!(self.offset % page_size() as u64, 0);
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn resource(&self) -> &MappedResource {
        &self.res
    }

    pub fn fsname(&self) -> &OsStr {
        &self.res.fsname
    }

    pub fn is_real_device(&self) -> bool {
        self.res.id.is_real_device()
    }

    /// A copy of this entry restricted to `[start, end)`. The offset of
    /// a real-device mapping shifts with the cut; pseudo-devices have no
    /// meaningful file offset so theirs stays 0.
    pub fn subrange(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> Mapping {
        debug_assert!(start >= self.start() && end <= self.end());
        let delta = if self.is_real_device() {
            (start - self.start()) as u64
        } else {
            0
        };
        Mapping::from_range(
            start,
            end,
            self.prot,
            self.flags,
            if self.is_real_device() {
                self.offset + delta
            } else {
                0
            },
            self.res.clone(),
        )
    }

    pub fn extend(&self, end: RemotePtr<Void>) -> Mapping {
        debug_assert!(end >= self.end());
        Mapping::from_range(self.start(), end, self.prot, self.flags, self.offset, self.res.clone())
    }

    pub fn set_range(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> Mapping {
        Mapping::from_range(start, end, self.prot, self.flags, self.offset, self.res.clone())
    }

    pub fn set_prot(&self, prot: ProtFlags) -> Mapping {
        Mapping::from_range(
            self.start(),
            self.end(),
            prot,
            self.flags,
            self.offset,
            self.res.clone(),
        )
    }

    /// The lowest-common-denominator interpretation of this entry: the
    /// one that could be parsed back out of the kernel's map report.
    pub fn to_kernel(&self) -> Mapping {
        Mapping::from_range(
            self.start(),
            self.end(),
            self.prot,
            self.flags & Self::CHECKABLE_FLAGS_MASK,
            self.offset,
            self.res.to_kernel(),
        )
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(4);
        s.push(if self.prot.contains(ProtFlags::PROT_READ) {
            'r'
        } else {
            '-'
        });
        s.push(if self.prot.contains(ProtFlags::PROT_WRITE) {
            'w'
        } else {
            '-'
        });
        s.push(if self.prot.contains(ProtFlags::PROT_EXEC) {
            'x'
        } else {
            '-'
        });
        s.push(if self.flags.contains(MapFlags::MAP_SHARED) {
            's'
        } else {
            'p'
        });
        s
    }
}

// Manual so every copy revalidates its invariants.
impl Clone for Mapping {
    fn clone(&self) -> Self {
        let result = Mapping {
            mr: self.mr,
            prot: self.prot,
            flags: self.flags,
            offset: self.offset,
            res: self.res.clone(),
        };
        result.assert_valid();
        result
    }
}

impl Deref for Mapping {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

impl DerefMut for Mapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.mr
    }
}

impl Display for Mapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:8x}-{:8x} {} {:08x} {}",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot_string(),
            self.offset,
            self.res
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anonymous_inodes_are_fresh_but_equivalent() {
        let a = MappedResource::anonymous();
        let b = MappedResource::anonymous();
        assert_ne!(a.id.inode(), b.id.inode());
        // Equivalence ignores the synthetic inode for anonymous
        // resources; it exists to keep the resources distinct as map
        // values, not to defeat coalescing checks.
        assert!(a.id.equivalent_to(&b.id));
    }

    #[test]
    fn pseudo_kinds_are_not_equivalent_across_kinds() {
        let heap = ResourceId::pseudo_only(PseudoDevice::Heap);
        let stack = ResourceId::pseudo_only(PseudoDevice::Stack);
        assert!(!heap.equivalent_to(&stack));
        assert!(heap.equivalent_to(&heap));
    }

    #[test]
    fn minor_may_vary_when_major_is_zero() {
        let a = ResourceId::from_major_minor(0, 1, 77, PseudoDevice::None);
        let b = ResourceId::from_major_minor(0, 9, 77, PseudoDevice::None);
        assert!(a.equivalent_to(&b));

        let c = ResourceId::from_major_minor(8, 1, 77, PseudoDevice::None);
        let d = ResourceId::from_major_minor(8, 2, 77, PseudoDevice::None);
        assert!(!c.equivalent_to(&d));

        let e = ResourceId::from_major_minor(8, 1, 78, PseudoDevice::None);
        assert!(!c.equivalent_to(&e));
    }

    #[test]
    fn subrange_adjusts_offset_only_for_real_devices() {
        let p = page_size();
        let file = Mapping::new(
            0x1000usize.into(),
            4 * p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0x2000,
            MappedResource::new(
                ResourceId::from_major_minor(8, 1, 42, PseudoDevice::None),
                OsStr::new("/lib/libfoo.so"),
            ),
        );
        let cut = file.subrange((0x1000usize + p).into(), (0x1000usize + 2 * p).into());
        assert_eq!(0x2000 + p as u64, cut.file_offset_bytes());

        let anon = Mapping::new(
            0x1000usize.into(),
            4 * p,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            MappedResource::anonymous(),
        );
        let cut = anon.subrange((0x1000usize + p).into(), (0x1000usize + 2 * p).into());
        assert_eq!(0, cut.file_offset_bytes());
    }

    #[test]
    fn flags_outside_the_mask_are_dropped() {
        let m = Mapping::new(
            0usize.into(),
            page_size(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED | MapFlags::MAP_GROWSDOWN,
            0,
            MappedResource::anonymous(),
        );
        assert_eq!(MapFlags::MAP_PRIVATE, m.flags());
    }

    #[test]
    fn dump_line_format() {
        let m = Mapping::new(
            0x1000usize.into(),
            0x1000,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            MappedResource::heap(),
        );
        assert_eq!(
            "    1000-    2000 rw-p 00000000 00:00 0          [heap] (heap)",
            format!("{}", m)
        );
    }

    #[test]
    fn kernel_projection_drops_pseudo_information() {
        let m = Mapping::new(
            0x1000usize.into(),
            0x1000,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
            0,
            MappedResource::anonymous(),
        );
        let k = m.to_kernel();
        assert_eq!(MapFlags::MAP_PRIVATE, k.flags());
        assert_eq!(PseudoDevice::None, k.resource().id.psdev());
        assert_eq!(0, k.resource().id.disp_inode());
    }
}
