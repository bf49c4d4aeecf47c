//! The address-space core of the rewind record/replay supervisor.
//!
//! A supervisor that records and deterministically replays a set of
//! Linux processes has to keep a shadow of each tracee's kernel mapping
//! table that stays bit-identical across mmap/mremap/mprotect/munmap/brk
//! despite the kernel's subtle adjacent-merge rules, and it has to
//! arbitrate a handful of hardware debug registers between debugger
//! users and its own replay machinery. This crate is that data
//! structure: [`address_space::AddressSpace`] and the pieces it is
//! composed of.
//!
//! The ptrace driver, trace I/O, scheduler and syscall interpretation
//! live elsewhere; they reach the core through the narrow
//! [`task::Task`] interface.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod address_space;
pub mod kernel_metadata;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod scoped_fd;
pub mod task;
pub mod util;
pub mod weak_ptr_set;
