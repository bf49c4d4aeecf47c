use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::{
    fmt::{self, Display, Formatter},
    os::unix::io::RawFd,
};

/// An owned file descriptor, closed on drop. The tracee mem fd lives in
/// one of these.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> ScopedFd {
        let fd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Nothing useful to do if close fails.
            let _ = close(self.fd);
        }
        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Relinquish ownership of the fd.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> ScopedFd {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

impl Display for ScopedFd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.fd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_relinquishes() {
        let mut fd = ScopedFd::from_raw(42);
        assert_eq!(42, fd.extract());
        assert!(!fd.is_open());
        // Nothing left to close on drop.
    }
}
