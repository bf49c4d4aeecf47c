pub mod breakpoint;
pub mod kernel_map_iterator;
pub mod mapping;
pub mod mapping_table;
pub mod memory_range;
mod verifier;
pub mod watchpoint;

use crate::{
    log::LogLevel::LogDebug,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    task::{Task, WeakTaskPtr, WeakTaskPtrSet},
    util::{
        ceil_page_size, find, SYSCALLBUF_LIB_FILENAME, SYSCALLBUF_LIB_FILENAME_32,
    },
};
use self::{
    breakpoint::{BreakpointRegistry, BreakpointType},
    kernel_map_iterator::KernelMapIterator,
    mapping::{MappedResource, Mapping},
    mapping_table::MappingTable,
    memory_range::MemoryRange,
    verifier::VerifyAddressSpace,
    watchpoint::{WatchType, WatchpointRegistry},
};
use libc::pid_t;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    cell::{Cell, Ref, RefCell},
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
    rc::Rc,
};

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

/// Models the address space of a set of tasks: the shadow of the
/// kernel's mapping table for those tasks, the resources the mappings
/// refer to, and the breakpoints and watchpoints their debugging
/// subscribers have planted.
///
/// Created either when a tracee execs a fresh image (populated from the
/// kernel's map report) or when a tracee is cloned without shared VM
/// (copied from the parent space). Participant tasks hold it alive
/// through `Rc`; the space holds its tasks weakly, only to iterate them
/// when programming debug registers.
pub struct AddressSpace {
    task_set: RefCell<WeakTaskPtrSet>,
    mem: RefCell<MappingTable>,
    breakpoints: RefCell<BreakpointRegistry>,
    /// Watchpoints are programmed per task, but tracked per address
    /// space on behalf of debuggers that assume that model.
    watchpoints: RefCell<WatchpointRegistry>,
    /// Path of the executable image this address space was exec()'d
    /// with.
    exe: OsString,
    /// The process-global heap, tracked to support adjustments by brk().
    heap: Cell<MemoryRange>,
    /// Were we cloned from another address space?
    is_clone: bool,
    /// First mapped byte of the vdso.
    vdso_start_addr: Cell<RemotePtr<Void>>,
    /// First mapped byte of libc's text section.
    libc_start_addr: Cell<RemotePtr<Void>>,
    /// First mapped byte of libpthread's text section. May stay null.
    libpthread_start_addr: Cell<RemotePtr<Void>>,
    syscallbuf_lib_start_: Cell<RemotePtr<Void>>,
    syscallbuf_lib_end_: Cell<RemotePtr<Void>>,
    /// Tracee memory is read and written through this fd, which is
    /// opened for the tracee's magic /proc/<tid>/mem device. The
    /// advantage over ptrace is that we can access it even when the
    /// tracee isn't at a ptrace-stop. Users should fall back to
    /// ptrace-based access when it is not open.
    child_mem_fd: RefCell<ScopedFd>,
}

impl AddressSpace {
    /// A space for a freshly exec'd image. Call `after_exec` (or feed
    /// `populate` yourself) once the tracee is known to be inside the
    /// new image.
    pub fn new_after_execve(exe: &OsStr) -> AddressSpace {
        AddressSpace {
            task_set: Default::default(),
            mem: RefCell::new(MappingTable::new()),
            breakpoints: Default::default(),
            watchpoints: Default::default(),
            exe: exe.to_owned(),
            heap: Cell::new(MemoryRange::default()),
            is_clone: false,
            vdso_start_addr: Default::default(),
            libc_start_addr: Default::default(),
            libpthread_start_addr: Default::default(),
            syscallbuf_lib_start_: Default::default(),
            syscallbuf_lib_end_: Default::default(),
            child_mem_fd: Default::default(),
        }
    }

    /// A space cloned from `o` for a fork without shared VM. The child
    /// inherits the parent's mappings wholesale, and the trap bytes
    /// physically exist in the child's text, so breakpoint records carry
    /// over. Watchpoint subscriptions don't: debug registers are per
    /// task and debugging subscribers must re-subscribe.
    pub fn new_after_fork(o: &AddressSpace) -> AddressSpace {
        AddressSpace {
            task_set: Default::default(),
            mem: RefCell::new(o.mem.borrow().clone()),
            breakpoints: RefCell::new(o.breakpoints.borrow().clone()),
            watchpoints: Default::default(),
            exe: o.exe.clone(),
            heap: o.heap.clone(),
            is_clone: true,
            vdso_start_addr: o.vdso_start_addr.clone(),
            libc_start_addr: o.libc_start_addr.clone(),
            libpthread_start_addr: o.libpthread_start_addr.clone(),
            syscallbuf_lib_start_: o.syscallbuf_lib_start_.clone(),
            syscallbuf_lib_end_: o.syscallbuf_lib_end_.clone(),
            child_mem_fd: Default::default(),
        }
    }

    /// Return true if this was created by an exec() call, instead of
    /// cloned from another address space.
    pub fn execed(&self) -> bool {
        !self.is_clone
    }

    /// Return the path this address space was exec()'d with.
    pub fn exe_image(&self) -> &OsStr {
        &self.exe
    }

    pub fn insert_task(&self, t: WeakTaskPtr) {
        self.task_set.borrow_mut().insert(t);
    }

    pub fn erase_task(&self, t: &WeakTaskPtr) {
        self.task_set.borrow_mut().erase(t);
    }

    pub fn has_task(&self, t: &WeakTaskPtr) -> bool {
        self.task_set.borrow().has(t)
    }

    pub fn task_count(&self) -> usize {
        self.task_set.borrow().len()
    }

    /// Call this once the tracee is known to be inside the fresh
    /// post-exec image: populates the table from the kernel's
    /// authoritative map report.
    pub fn after_exec(&self, t: &dyn Task) {
        self.populate(t, KernelMapIterator::new_from_tid(t.tid()));
        ed_assert!(t, !self.vdso_start_addr.get().is_null());
    }

    /// Populate the table from kernel map report entries, detecting the
    /// well-known regions as they go by.
    pub fn populate<I: Iterator<Item = Mapping>>(&self, t: &dyn Task, entries: I) {
        for km in entries {
            self.process_map_report_entry(t, km);
        }
    }

    /// Call this after a new task has been cloned within this address
    /// space: the newcomer needs its debug registers programmed.
    pub fn after_clone(&self, t: &mut dyn Task) {
        self.allocate_watchpoints(t);
    }

    /// Call this when an exec replaces `other` with this space for some
    /// process: resources the new space inherits from the kernel move
    /// over. Currently that is the tracee mem fd.
    pub fn replace(&self, other: &AddressSpace) {
        let fd = other.child_mem_fd.borrow_mut().extract();
        *self.child_mem_fd.borrow_mut() = ScopedFd::from_raw(fd);
    }

    /// Change the program data break of this address space to `addr`.
    pub fn brk(&self, addr: RemotePtr<Void>) {
        log!(LogDebug, "brk({})", addr);

        let heap = self.heap.get();
        assert!(heap.start() <= addr);
        if addr == heap.end() {
            return;
        }

        self.update_heap(heap.start(), addr);
        let heap = self.heap.get();
        if heap.is_empty() {
            return;
        }
        self.map(
            heap.start(),
            ceil_page_size(heap.size()),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
            0,
            MappedResource::heap(),
        );
    }

    pub fn heap_range(&self) -> MemoryRange {
        self.heap.get()
    }

    /// Map `num_bytes` at `addr` with `prot` protection and `flags`,
    /// (possibly initially) backed starting at `offset_bytes` of `res`.
    pub fn map(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset_bytes: u64,
        res: MappedResource,
    ) -> Mapping {
        let m = self
            .mem
            .borrow_mut()
            .map(addr, num_bytes, prot, flags, offset_bytes, res);

        if prot.contains(ProtFlags::PROT_EXEC)
            && (find(m.fsname().as_bytes(), SYSCALLBUF_LIB_FILENAME).is_some()
                || find(m.fsname().as_bytes(), SYSCALLBUF_LIB_FILENAME_32).is_some())
        {
            self.syscallbuf_lib_start_.set(m.start());
            self.syscallbuf_lib_end_.set(m.end());
        }
        m
    }

    /// Make `[addr, addr + num_bytes)` inaccessible within this address
    /// space.
    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        self.mem.borrow_mut().unmap(addr, num_bytes);
    }

    /// Change the protection bits of `[addr, addr + num_bytes)` to
    /// `prot`.
    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        self.mem.borrow_mut().protect(addr, num_bytes, prot);
    }

    /// Move the mapping `[old_addr, old_addr + old_num_bytes)` to
    /// `[new_addr, new_addr + new_num_bytes)`, preserving metadata.
    pub fn remap(
        &self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        self.mem
            .borrow_mut()
            .remap(old_addr, old_num_bytes, new_addr, new_num_bytes);
    }

    /// Return the entry containing the byte at `addr`.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<Ref<Mapping>> {
        let mem = self.mem.borrow();
        if mem.mapping_of(addr).is_none() {
            return None;
        }
        Some(Ref::map(mem, |table| table.mapping_of(addr).unwrap()))
    }

    /// The whole table, for callers that iterate (checksummers,
    /// dumpers).
    pub fn maps(&self) -> Ref<MappingTable> {
        self.mem.borrow()
    }

    /// Dump a representation of this space in a format similar to the
    /// kernel's map report, one line per entry plus the heap summary.
    pub fn dump(&self) -> String {
        let heap = self.heap.get();
        let mut out = format!("  (heap: {}-{})\n", heap.start(), heap.end());
        for m in self.mem.borrow().iter() {
            out += &format!("{}\n", m);
        }
        out
    }

    /// Return the vdso mapping of this space. Panics if the vdso hasn't
    /// been seen.
    pub fn vdso(&self) -> Mapping {
        debug_assert!(!self.vdso_start_addr.get().is_null());
        self.mapping_of(self.vdso_start_addr.get()).unwrap().clone()
    }

    pub fn has_libc(&self) -> bool {
        !self.libc_start_addr.get().is_null()
    }

    /// The libc text mapping. `has_libc()` must be true.
    pub fn libc(&self) -> Mapping {
        self.mapping_of(self.libc_start_addr.get()).unwrap().clone()
    }

    pub fn has_libpthread(&self) -> bool {
        !self.libpthread_start_addr.get().is_null()
    }

    /// The libpthread text mapping. `has_libpthread()` must be true.
    pub fn libpthread(&self) -> Mapping {
        self.mapping_of(self.libpthread_start_addr.get())
            .unwrap()
            .clone()
    }

    /// The executable range of the syscallbuf preload library, once it
    /// has been mapped.
    pub fn syscallbuf_lib_range(&self) -> Option<MemoryRange> {
        if self.syscallbuf_lib_start_.get().is_null() {
            None
        } else {
            Some(MemoryRange::from_range(
                self.syscallbuf_lib_start_.get(),
                self.syscallbuf_lib_end_.get(),
            ))
        }
    }

    /// Ensure a breakpoint of `type_` is set at `addr`. False if the
    /// instruction byte couldn't be read.
    pub fn add_breakpoint(
        &self,
        t: &mut dyn Task,
        addr: RemoteCodePtr,
        type_: BreakpointType,
    ) -> bool {
        self.breakpoints.borrow_mut().add(t, addr, type_)
    }

    /// Remove a `type_` reference to the breakpoint at `addr`. If the
    /// removed reference was the last, the breakpoint is destroyed.
    pub fn remove_breakpoint(&self, t: &mut dyn Task, addr: RemoteCodePtr, type_: BreakpointType) {
        self.breakpoints.borrow_mut().remove(t, addr, type_);
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints.borrow().bp_type_at_addr(addr)
    }

    /// Assuming the last retired instruction has raised a SIGTRAP and
    /// might be a breakpoint trap instruction, return the type of
    /// breakpoint set at `ip() - sizeof(breakpoint_insn)`, if one
    /// exists.
    pub fn get_breakpoint_type_for_retired_insn(&self, ip: RemoteCodePtr) -> BreakpointType {
        self.breakpoints.borrow().bp_type_for_retired_insn(ip)
    }

    /// Destroy all breakpoints in this VM, regardless of their reference
    /// counts.
    pub fn destroy_all_breakpoints(&self, t: &mut dyn Task) {
        self.breakpoints.borrow_mut().clear_all(t);
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.borrow().is_empty()
    }

    /// The buffer `dest` represents the contents of tracee memory at
    /// `addr`. Replace the bytes in `dest` that have been overwritten by
    /// breakpoints with the original data that was replaced.
    pub fn replace_breakpoints_with_original_values(&self, dest: &mut [u8], addr: RemotePtr<u8>) {
        self.breakpoints
            .borrow()
            .replace_with_original_values(dest, addr);
    }

    /// Call this when memory at `[addr, addr+len)` was externally
    /// overwritten: any breakpoint in the range re-snapshots the new
    /// byte and re-plants its trap.
    pub fn maybe_update_breakpoints(&self, t: &mut dyn Task, addr: RemotePtr<u8>, len: usize) {
        self.breakpoints.borrow_mut().maybe_update(t, addr, len);
    }

    /// Temporarily remove the breakpoint at `addr`.
    pub fn suspend_breakpoint_at(&self, t: &mut dyn Task, addr: RemoteCodePtr) {
        self.breakpoints.borrow().suspend_at(t, addr);
    }

    /// Restore a temporarily removed breakpoint at `addr`.
    pub fn restore_breakpoint_at(&self, t: &mut dyn Task, addr: RemoteCodePtr) {
        self.breakpoints.borrow().restore_at(t, addr);
    }

    /// Manage watchpoints. Analogous to the breakpoint methods above,
    /// except that watchpoints are set on address ranges. Returns false
    /// if the derived hardware slot set doesn't fit some participant's
    /// debug registers; the logical request is retained either way, and
    /// the caller must remove it to recover.
    pub fn add_watchpoint(
        &self,
        t: &mut dyn Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        self.watchpoints.borrow_mut().watch(addr, num_bytes, type_);
        self.allocate_watchpoints(t)
    }

    pub fn remove_watchpoint(
        &self,
        t: &mut dyn Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) {
        self.watchpoints.borrow_mut().unwatch(addr, num_bytes, type_);
        self.allocate_watchpoints(t);
    }

    pub fn destroy_all_watchpoints(&self, t: &mut dyn Task) {
        self.watchpoints.borrow_mut().clear();
        self.allocate_watchpoints(t);
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.watchpoints.borrow().is_empty()
    }

    pub fn mem_fd(&self) -> Ref<ScopedFd> {
        self.child_mem_fd.borrow()
    }

    pub fn set_mem_fd(&self, fd: ScopedFd) {
        *self.child_mem_fd.borrow_mut() = fd;
    }

    /// Verify that this cached address space matches what the kernel
    /// thinks it should be. Any divergence is fatal.
    pub fn verify(&self, t: &dyn Task) {
        log!(LogDebug, "Verifying address space for task {}", t.tid());
        self.verify_against(t, KernelMapIterator::new_from_tid(t.tid()));
    }

    /// Like `verify`, against an arbitrary kernel map source.
    pub fn verify_against<I: Iterator<Item = Mapping>>(&self, t: &dyn Task, kernel_maps: I) {
        let shadow: Vec<Mapping> = self.mem.borrow().iter().map(|m| m.to_kernel()).collect();
        let mut vas = VerifyAddressSpace::new(shadow, self.dump());
        for km in kernel_maps {
            vas.process_kernel_entry(t, km);
        }
        vas.finish(t);
    }

    /// Dump the kernel's own map report for `tid`.
    pub fn dump_process_maps(tid: pid_t) -> String {
        let mut out = String::new();
        for km in KernelMapIterator::new_from_tid(tid) {
            out += &format!("{}\n", km);
        }
        out
    }

    /// Read the kernel map entry covering `addr`. Does no caching.
    pub fn read_kernel_mapping(tid: pid_t, addr: RemotePtr<Void>) -> Mapping {
        for km in KernelMapIterator::new_from_tid(tid) {
            if km.contains_ptr(addr) {
                return km;
            }
        }
        fatal!("No kernel mapping at {:#x} for tracee {}", addr.as_usize(), tid)
    }

    fn update_heap(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) {
        self.heap.set(MemoryRange::from_range(start, end));
    }

    fn process_map_report_entry(&self, t: &dyn Task, km: Mapping) {
        let name = km.fsname().to_os_string();

        // Before a real [heap] segment is seen, guess that the heap
        // starts at the end of the first readable-or-writable,
        // non-executable mapping of the exe image.
        let heap = self.heap.get();
        if heap.start().is_null()
            && self.exe == name
            && !km.prot().contains(ProtFlags::PROT_EXEC)
            && km
                .prot()
                .intersects(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        {
            self.update_heap(km.end(), km.end());
            log!(
                LogDebug,
                "  guessing heap starts at {} (end of text segment)",
                km.end()
            );
        }

        let is_dynamic_heap = name == "[heap]";
        // This segment is adjacent to our previous guess at the start of
        // the dynamic heap, but it's still not an explicit heap segment.
        // Or, in corner cases, it's a further data segment of the exe
        // image not adjacent to the previously mapped one. Update the
        // guess.
        let heap = self.heap.get();
        if !is_dynamic_heap
            && !km.prot().contains(ProtFlags::PROT_EXEC)
            && (heap.end() == km.start() || self.exe == name)
        {
            debug_assert!(heap.start() == heap.end() || self.exe == name);
            self.update_heap(km.end(), km.end());
            log!(
                LogDebug,
                "  updating start-of-heap guess to {} (end of mapped-data segment)",
                km.end()
            );
        }

        let res: MappedResource;
        if is_dynamic_heap {
            let heap = self.heap.get();
            if heap.start().is_null() {
                // No guess yet; assume the heap is just this segment.
                self.update_heap(km.start(), km.end());
            } else {
                self.update_heap(heap.start(), km.end());
            }
            res = MappedResource::heap();
        } else if name.as_bytes().starts_with(b"[stack") {
            res = MappedResource::stack(t.tid());
        } else if name == "[vdso]" {
            ed_assert!(t, self.vdso_start_addr.get().is_null());
            self.vdso_start_addr.set(km.start());
            res = MappedResource::vdso();
        } else {
            res = MappedResource::new(km.resource().id, &name);
        }

        if km.prot().contains(ProtFlags::PROT_EXEC) {
            if self.libc_start_addr.get().is_null() && is_libc_filename(&name) {
                self.libc_start_addr.set(km.start());
            }
            if self.libpthread_start_addr.get().is_null() && is_libpthread_filename(&name) {
                self.libpthread_start_addr.set(km.start());
            }
        }

        self.map(
            km.start(),
            km.size(),
            km.prot(),
            km.flags(),
            km.file_offset_bytes(),
            res,
        );
    }

    /// Construct the minimal set of hardware slots realizing the current
    /// watch requests and program it into every participant task's debug
    /// registers. The active task is passed explicitly because the
    /// caller usually holds its borrow.
    fn allocate_watchpoints(&self, active_task: &mut dyn Task) -> bool {
        let regs = self.watchpoints.borrow().get_watch_configs();

        let mut ok = active_task.set_debug_regs(&regs);
        let active_tid = active_task.tid();
        for t in self.task_set.borrow().iter() {
            let mut tb = t.borrow_mut();
            if tb.tid() == active_tid {
                continue;
            }
            if !tb.set_debug_regs(&regs) {
                ok = false;
            }
        }
        ok
    }
}

fn basename(path: &OsStr) -> &[u8] {
    let bytes = path.as_bytes();
    match bytes.iter().rposition(|&c| c == b'/') {
        Some(i) => &bytes[i + 1..],
        None => bytes,
    }
}

fn is_libc_filename(path: &OsStr) -> bool {
    let base = basename(path);
    base.starts_with(b"libc.so") || base.starts_with(b"libc-")
}

fn is_libpthread_filename(path: &OsStr) -> bool {
    let base = basename(path);
    base.starts_with(b"libpthread.so") || base.starts_with(b"libpthread-")
}
