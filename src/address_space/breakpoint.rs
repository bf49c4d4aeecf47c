use crate::{
    log::LogLevel::LogDebug,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::RemotePtr,
    task::Task,
};
use std::{
    cmp::{max, min},
    collections::HashMap,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    BkptNone = 0,
    /// Trap for internal replay purposes, f.e. replaying async signals.
    BkptInternal = 1,
    /// Trap on behalf of a debugger user.
    BkptUser = 2,
}

/// Represents a refcount set on a particular address. Because there can
/// be multiple refcounts of multiple types set on a single address, a
/// record stores explicit USER and INTERNAL counts. The record must be
/// unique per address since we have to save the overwritten data, and we
/// can't enforce the order in which breakpoints are set/removed.
///
/// The counts are unsigned; an underflow panics in the debug build
/// rather than going negative.
#[derive(Clone)]
struct Breakpoint {
    internal_count: u32,
    user_count: u32,
    overwritten_data: u8,
}

impl Breakpoint {
    fn new(overwritten_data: u8) -> Breakpoint {
        Breakpoint {
            internal_count: 0,
            user_count: 0,
            overwritten_data,
        }
    }

    fn do_ref(&mut self, which: BreakpointType) {
        *self.counter(which) += 1;
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        *self.counter(which) -= 1;
        self.internal_count + self.user_count
    }

    fn bp_type(&self) -> BreakpointType {
        // USER breakpoints need to be processed before INTERNAL ones: we
        // want to give the debugger a chance to dispatch commands before
        // we attend to internal replay business. So if there's a USER
        // ref on the breakpoint, treat it as a USER breakpoint.
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else {
            BreakpointType::BkptInternal
        }
    }

    fn counter(&mut self, which: BreakpointType) -> &mut u32 {
        debug_assert!(which != BreakpointType::BkptNone);
        if which == BreakpointType::BkptUser {
            &mut self.user_count
        } else {
            &mut self.internal_count
        }
    }
}

type BreakpointMap = HashMap<RemoteCodePtr, Breakpoint>;

/// Software breakpoints of one address space. The trap byte is
/// physically present in tracee memory exactly while a record exists.
#[derive(Clone, Default)]
pub struct BreakpointRegistry {
    breakpoints: BreakpointMap,
}

impl BreakpointRegistry {
    /// Encoding of the `int $3` instruction.
    pub const BREAKPOINT_INSN: u8 = 0xCC;

    pub fn new() -> BreakpointRegistry {
        BreakpointRegistry {
            breakpoints: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Ensure a breakpoint of `type_` is set at `addr`. On the first
    /// reference the original instruction byte is read through `t` and
    /// saved before the trap byte is planted; if that read fails no
    /// record is created and false is returned.
    pub fn add(&mut self, t: &mut dyn Task, addr: RemoteCodePtr, type_: BreakpointType) -> bool {
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            bp.do_ref(type_);
            return true;
        }

        let mut overwritten_data = [0u8; 1];
        match t.read_bytes_fallible(addr.to_data_ptr::<u8>(), &mut overwritten_data) {
            Ok(1) => (),
            _ => return false,
        }
        ed_assert!(
            t,
            t.write_bytes(addr.to_data_ptr::<u8>(), &[Self::BREAKPOINT_INSN])
                .is_ok(),
            "Couldn't write breakpoint insn at {}",
            addr
        );

        let mut bp = Breakpoint::new(overwritten_data[0]);
        bp.do_ref(type_);
        self.breakpoints.insert(addr, bp);
        true
    }

    /// Remove a `type_` reference to the breakpoint at `addr`. If the
    /// removed reference was the last, the saved byte is restored and
    /// the record destroyed.
    pub fn remove(&mut self, t: &mut dyn Task, addr: RemoteCodePtr, type_: BreakpointType) {
        let can_destroy = match self.breakpoints.get_mut(&addr) {
            Some(bp) => bp.do_unref(type_) == 0,
            None => false,
        };
        if can_destroy {
            self.destroy_at(t, addr);
        }
    }

    pub fn bp_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .get(&addr)
            .map_or(BreakpointType::BkptNone, |bp| bp.bp_type())
    }

    /// Assuming the last retired instruction has raised a SIGTRAP and
    /// might be a breakpoint trap instruction, return the type of
    /// breakpoint set at `ip - sizeof(breakpoint_insn)`, if one exists.
    pub fn bp_type_for_retired_insn(&self, ip: RemoteCodePtr) -> BreakpointType {
        self.bp_type_at_addr(ip.decrement_by_bkpt_insn_length())
    }

    /// Destroy all records regardless of their reference counts,
    /// restoring every saved byte. Used at exec, when the text is being
    /// replaced anyway.
    pub fn clear_all(&mut self, t: &mut dyn Task) {
        let addrs: Vec<RemoteCodePtr> = self.breakpoints.keys().copied().collect();
        for addr in addrs {
            self.destroy_at(t, addr);
        }
    }

    /// The buffer `dest` represents the contents of tracee memory at
    /// `addr`. Replace the bytes in `dest` that have been overwritten by
    /// breakpoints with the original data, so checksums and dumps see
    /// the pristine text.
    pub fn replace_with_original_values(&self, dest: &mut [u8], addr: RemotePtr<u8>) {
        for (k, v) in self.breakpoints.iter() {
            let bkpt_location = k.to_data_ptr::<u8>();
            let start = max(addr, bkpt_location);
            let end = min(addr + dest.len(), bkpt_location + 1usize);
            if start < end {
                dest[start - addr] = v.overwritten_data;
            }
        }
    }

    /// Call this when `[addr, addr + len)` was externally overwritten:
    /// re-snapshot the underlying byte of any breakpoint in the range
    /// and re-plant the trap.
    pub fn maybe_update(&mut self, t: &mut dyn Task, addr: RemotePtr<u8>, len: usize) {
        for (k, v) in self.breakpoints.iter_mut() {
            let bp_addr = k.to_data_ptr::<u8>();
            if addr <= bp_addr && bp_addr < addr + len {
                let mut data = [0u8; 1];
                let read = t.read_bytes_fallible(bp_addr, &mut data);
                ed_assert_eq!(t, read, Ok(1));
                v.overwritten_data = data[0];
                ed_assert!(t, t.write_bytes(bp_addr, &[Self::BREAKPOINT_INSN]).is_ok());
            }
        }
    }

    /// Temporarily remove the trap byte at `addr`, leaving the record
    /// (and its refcounts) alone.
    pub fn suspend_at(&self, t: &mut dyn Task, addr: RemoteCodePtr) {
        if let Some(bp) = self.breakpoints.get(&addr) {
            ed_assert!(
                t,
                t.write_bytes(addr.to_data_ptr::<u8>(), &[bp.overwritten_data])
                    .is_ok()
            );
        }
    }

    /// Restore a trap byte previously lifted by `suspend_at`.
    pub fn restore_at(&self, t: &mut dyn Task, addr: RemoteCodePtr) {
        if self.breakpoints.get(&addr).is_some() {
            ed_assert!(
                t,
                t.write_bytes(addr.to_data_ptr::<u8>(), &[Self::BREAKPOINT_INSN])
                    .is_ok()
            );
        }
    }

    fn destroy_at(&mut self, t: &mut dyn Task, addr: RemoteCodePtr) {
        let data = self.breakpoints.get(&addr).unwrap().overwritten_data;
        log!(LogDebug, "Writing back {:#x} at {}", data, addr);
        ed_assert!(
            t,
            t.write_bytes(addr.to_data_ptr::<u8>(), &[data]).is_ok(),
            "Couldn't restore byte at {}",
            addr
        );
        self.breakpoints.remove(&addr);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::test_util::FakeTask;

    const CODE_BASE: usize = 0x70000000;

    fn task_with_byte(addr: usize, val: u8) -> FakeTask {
        let mut t = FakeTask::new(100, CODE_BASE, 0x1000);
        t.poke(addr, val);
        t
    }

    #[test]
    fn refcounts_and_byte_fidelity() {
        let addr = RemoteCodePtr::new(CODE_BASE + 0x10);
        let mut t = task_with_byte(CODE_BASE + 0x10, 0x5a);
        let mut bps = BreakpointRegistry::new();

        assert!(bps.add(&mut t, addr, BreakpointType::BkptInternal));
        assert_eq!(
            BreakpointRegistry::BREAKPOINT_INSN,
            t.peek(CODE_BASE + 0x10)
        );
        assert!(bps.add(&mut t, addr, BreakpointType::BkptUser));
        assert!(bps.add(&mut t, addr, BreakpointType::BkptUser));

        bps.remove(&mut t, addr, BreakpointType::BkptUser);
        // One user ref left; user still wins dispatch.
        assert_eq!(BreakpointType::BkptUser, bps.bp_type_at_addr(addr));
        assert_eq!(
            BreakpointRegistry::BREAKPOINT_INSN,
            t.peek(CODE_BASE + 0x10)
        );

        bps.remove(&mut t, addr, BreakpointType::BkptUser);
        assert_eq!(BreakpointType::BkptInternal, bps.bp_type_at_addr(addr));
        assert_eq!(
            BreakpointRegistry::BREAKPOINT_INSN,
            t.peek(CODE_BASE + 0x10)
        );

        bps.remove(&mut t, addr, BreakpointType::BkptInternal);
        assert_eq!(BreakpointType::BkptNone, bps.bp_type_at_addr(addr));
        assert_eq!(0x5a, t.peek(CODE_BASE + 0x10));
        assert!(bps.is_empty());
    }

    #[test]
    fn add_fails_on_unreadable_address() {
        let mut t = FakeTask::new(100, CODE_BASE, 0x1000);
        let mut bps = BreakpointRegistry::new();
        let unmapped = RemoteCodePtr::new(0x10);
        assert!(!bps.add(&mut t, unmapped, BreakpointType::BkptUser));
        assert_eq!(BreakpointType::BkptNone, bps.bp_type_at_addr(unmapped));
        assert!(bps.is_empty());
    }

    #[test]
    fn retired_insn_lookup_is_off_by_trap_length() {
        let addr = RemoteCodePtr::new(CODE_BASE + 0x20);
        let mut t = task_with_byte(CODE_BASE + 0x20, 0x90);
        let mut bps = BreakpointRegistry::new();
        assert!(bps.add(&mut t, addr, BreakpointType::BkptUser));
        assert_eq!(
            BreakpointType::BkptUser,
            bps.bp_type_for_retired_insn(addr.increment_by_bkpt_insn_length())
        );
        assert_eq!(BreakpointType::BkptNone, bps.bp_type_for_retired_insn(addr));
    }

    #[test]
    fn clear_all_restores_regardless_of_refcounts() {
        let mut t = task_with_byte(CODE_BASE + 0x30, 0x11);
        t.poke(CODE_BASE + 0x40, 0x22);
        let a1 = RemoteCodePtr::new(CODE_BASE + 0x30);
        let a2 = RemoteCodePtr::new(CODE_BASE + 0x40);
        let mut bps = BreakpointRegistry::new();
        assert!(bps.add(&mut t, a1, BreakpointType::BkptUser));
        assert!(bps.add(&mut t, a1, BreakpointType::BkptInternal));
        assert!(bps.add(&mut t, a2, BreakpointType::BkptUser));

        bps.clear_all(&mut t);
        assert!(bps.is_empty());
        assert_eq!(0x11, t.peek(CODE_BASE + 0x30));
        assert_eq!(0x22, t.peek(CODE_BASE + 0x40));
    }

    #[test]
    fn overlay_original_bytes() {
        let mut t = task_with_byte(CODE_BASE + 0x34, 0x5a);
        let addr = RemoteCodePtr::new(CODE_BASE + 0x34);
        let mut bps = BreakpointRegistry::new();
        assert!(bps.add(&mut t, addr, BreakpointType::BkptInternal));

        // Pretend we read 8 bytes of tracee memory around the trap.
        let mut buf = [0u8; 8];
        t.read_bytes_fallible((CODE_BASE + 0x30).into(), &mut buf)
            .unwrap();
        assert_eq!(BreakpointRegistry::BREAKPOINT_INSN, buf[4]);
        bps.replace_with_original_values(&mut buf, (CODE_BASE + 0x30).into());
        assert_eq!(0x5a, buf[4]);
    }

    #[test]
    fn suspend_and_restore() {
        let mut t = task_with_byte(CODE_BASE + 0x50, 0x77);
        let addr = RemoteCodePtr::new(CODE_BASE + 0x50);
        let mut bps = BreakpointRegistry::new();
        assert!(bps.add(&mut t, addr, BreakpointType::BkptInternal));

        bps.suspend_at(&mut t, addr);
        assert_eq!(0x77, t.peek(CODE_BASE + 0x50));
        bps.restore_at(&mut t, addr);
        assert_eq!(
            BreakpointRegistry::BREAKPOINT_INSN,
            t.peek(CODE_BASE + 0x50)
        );
    }

    #[test]
    fn externally_overwritten_breakpoint_is_resnapshotted() {
        let mut t = task_with_byte(CODE_BASE + 0x60, 0x41);
        let addr = RemoteCodePtr::new(CODE_BASE + 0x60);
        let mut bps = BreakpointRegistry::new();
        assert!(bps.add(&mut t, addr, BreakpointType::BkptUser));

        // The tracee (or the kernel) rewrote the page under us.
        t.poke(CODE_BASE + 0x60, 0x42);
        bps.maybe_update(&mut t, (CODE_BASE + 0x60).into(), 1);
        assert_eq!(
            BreakpointRegistry::BREAKPOINT_INSN,
            t.peek(CODE_BASE + 0x60)
        );
        bps.remove(&mut t, addr, BreakpointType::BkptUser);
        assert_eq!(0x42, t.peek(CODE_BASE + 0x60));
    }
}
