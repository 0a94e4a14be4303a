use crate::{
    extension::{notify_extensions, Event},
    log::LogLevel::LogDebug,
    path::{
        binding::{substitute, Bindings, Side},
        canon::{canonicalize, ProcLink, Resolver},
        proc::proc_link,
    },
    tracee::{Tracee, TraceeTable},
    util::read_link,
};
use libc::AT_FDCWD;
use nix::{
    errno::Errno,
    sys::stat::{stat, SFlag},
};
use std::{
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    rc::Rc,
};

/// A path argument once resolved in the guest, and where it really is.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub guest: PathBuf,
    pub host: PathBuf,
}

/// Lookups on behalf of a tracee: extensions see every host path, and
/// `/proc` magic links answer with the tracee's emulated state.
struct TraceeResolver<'a> {
    tracee: &'a mut Tracee,
    others: &'a TraceeTable,
}

impl<'a> Resolver for TraceeResolver<'a> {
    fn host_path(&mut self, guest: &Path, is_final: bool) -> nix::Result<PathBuf> {
        let bindings = Rc::clone(&self.tracee.fs.borrow().bindings);
        let host = bindings.guest_to_host(guest);
        let status = notify_extensions(
            self.tracee,
            &mut Event::HostPath {
                path: &host,
                is_final,
            },
        );
        if status < 0 {
            return Err(Errno::from_i32(-status as i32));
        }
        Ok(host)
    }

    fn proc_link(&mut self, guest: &Path) -> nix::Result<Option<ProcLink>> {
        proc_link(self.tracee, self.others, guest)
    }
}

/// Resolve the path argument `path` of `tracee`, relative to `dirfd` as
/// the `*at` syscalls do.
pub fn translate_path(
    tracee: &mut Tracee,
    others: &TraceeTable,
    dirfd: i32,
    path: &Path,
    deref_final: bool,
) -> nix::Result<Translation> {
    let mut user_path = path.to_path_buf();
    let status = notify_extensions(
        tracee,
        &mut Event::GuestPath {
            path: &mut user_path,
        },
    );
    if status < 0 {
        return Err(Errno::from_i32(-status as i32));
    }

    let base = if user_path.is_absolute() {
        PathBuf::from("/")
    } else if dirfd == AT_FDCWD {
        tracee.fs.borrow().cwd.clone()
    } else {
        dirfd_guest_path(tracee, dirfd)?
    };

    let guest = canonicalize(
        &mut TraceeResolver { tracee, others },
        &base,
        &user_path,
        deref_final,
        0,
    )?;
    let host = tracee.fs.borrow().bindings.guest_to_host(&guest);
    log!(
        LogDebug,
        "pid {}: translate({:?} + {:?}) -> {:?}",
        tracee.pid,
        base,
        path,
        host
    );
    Ok(Translation { guest, host })
}

/// Guest path of the directory open as `dirfd` in `tracee`.
pub fn dirfd_guest_path(tracee: &Tracee, dirfd: i32) -> nix::Result<PathBuf> {
    let link = PathBuf::from(format!("/proc/{}/fd/{}", tracee.pid, dirfd));
    let host = read_link(&link).map_err(|_| Errno::EBADF)?;
    let st = stat(&host).map_err(|_| Errno::ENOTDIR)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
        return Err(Errno::ENOTDIR);
    }
    let bindings = Rc::clone(&tracee.fs.borrow().bindings);
    Ok(detranslate_path(&bindings, &host, None).unwrap_or(host))
}

/// Guest view of the host path `host`, or `None` if the guest sees it
/// unchanged.
///
/// `referrer` is the host path of the symlink `host` was read from, if
/// any. Symlink targets are taken literally unless the link lives in
/// `/proc`, or in a binding that also holds the target.
pub fn detranslate_path(bindings: &Bindings, host: &Path, referrer: Option<&Path>) -> Option<PathBuf> {
    // Relative symlink targets are already guest paths.
    if !host.is_absolute() {
        return None;
    }
    let follow_bindings = match referrer {
        None => true,
        Some(referrer) if referrer.starts_with("/proc") => true,
        Some(referrer) if !bindings.belongs_to_guestfs(referrer) => {
            match (
                bindings.get_binding(Side::Host, host),
                bindings.get_binding(Side::Host, referrer),
            ) {
                (Some(target), Some(link)) => std::ptr::eq(target, link),
                _ => false,
            }
        }
        Some(_) => false,
    };

    if follow_bindings {
        return bindings.host_to_guest(host);
    }
    let root = bindings.root();
    if root != Path::new("/") && host.starts_with(root) {
        return Some(substitute(host, root, Path::new("/")));
    }
    None
}

/// `detranslate_path` of a raw byte buffer (as read from the tracee).
pub fn detranslate_bytes(bindings: &Bindings, bytes: &[u8], referrer: Option<&Path>) -> Option<Vec<u8>> {
    let host = Path::new(std::ffi::OsStr::from_bytes(bytes));
    detranslate_path(bindings, host, referrer).map(|guest| guest.as_os_str().as_bytes().to_vec())
}
