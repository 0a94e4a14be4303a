use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::os::unix::io::RawFd;

/// A host file descriptor owned by vroot, closed on drop.
// Not Copy or Clone because of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> nix::Result<ScopedFd> {
        ScopedFd::open_path_with_mode(path, oflag, Mode::empty())
    }

    pub fn open_path_with_mode<P: ?Sized + NixPath>(
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> nix::Result<ScopedFd> {
        let fd = open(path, oflag | OFlag::O_CLOEXEC, mode)?;
        Ok(ScopedFd { fd })
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        // Errors on close are swallowed.
        let _ = close(self.fd);
    }
}
