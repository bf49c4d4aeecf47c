use crate::{
    address_space::watchpoint::WatchConfig,
    remote_ptr::{RemotePtr, Void},
    weak_ptr_set::WeakPtrSet,
};
use libc::pid_t;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub type TaskSharedPtr = Rc<RefCell<Box<dyn Task>>>;
pub type WeakTaskPtr = Weak<RefCell<Box<dyn Task>>>;
pub type WeakTaskPtrSet = WeakPtrSet<Box<dyn Task>>;

/// The slice of the ptrace driver this crate needs: byte-level access to
/// the tracee's memory and the ability to program its debug registers.
/// The supervisor has exclusive control of both between tracee stops, so
/// none of these suspend.
pub trait Task {
    fn tid(&self) -> pid_t;

    /// Read up to `buf.len()` bytes at `addr`. Returns the number of
    /// bytes actually read; `Err` if nothing could be read at all (e.g.
    /// the page is unmapped).
    fn read_bytes_fallible(&mut self, addr: RemotePtr<Void>, buf: &mut [u8])
        -> Result<usize, ()>;

    /// Write all of `buf` at `addr`.
    fn write_bytes(&mut self, addr: RemotePtr<Void>, buf: &[u8]) -> Result<(), ()>;

    /// Program the task's hardware debug registers to watch exactly
    /// `regs`. Returns false if `regs` does not fit the hardware pool.
    fn set_debug_regs(&mut self, regs: &[WatchConfig]) -> bool;
}
