use crate::remote_ptr::RemotePtr;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
};

/// Length of the single-byte trap instruction (`int $3`) on both x86
/// variants we support.
pub const BKPT_INSN_LENGTH: usize = 1;

/// An address that is known to point at tracee code. Kept distinct from
/// `RemotePtr` so that instruction-pointer adjustments are explicit.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn new(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn null() -> RemoteCodePtr {
        Self::new(0)
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn decrement_by_bkpt_insn_length(self) -> RemoteCodePtr {
        self - BKPT_INSN_LENGTH
    }

    pub fn increment_by_bkpt_insn_length(self) -> RemoteCodePtr {
        self + BKPT_INSN_LENGTH
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::new(self.ptr)
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::new(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new(self.ptr - delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = usize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.ptr - rhs.ptr
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(val: usize) -> Self {
        Self::new(val)
    }
}

impl<T> From<RemotePtr<T>> for RemoteCodePtr {
    fn from(p: RemotePtr<T>) -> Self {
        Self::new(p.as_usize())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bkpt_insn_adjustment() {
        let ip = RemoteCodePtr::new(0x1001);
        assert_eq!(0x1000, ip.decrement_by_bkpt_insn_length().as_usize());
        assert_eq!(ip, ip.decrement_by_bkpt_insn_length().increment_by_bkpt_insn_length());
    }

    #[test]
    fn data_ptr_conversion() {
        let ip = RemoteCodePtr::new(0x2000);
        assert_eq!(0x2000, ip.to_data_ptr::<u8>().as_usize());
    }
}
