use crate::{
    arch::Reg,
    path::translate::{dirfd_guest_path, translate_path, Translation},
    ptrace::{translate_ptrace_enter, wait::translate_wait_enter},
    registers::RegVersion,
    syscall::{execve::translate_execve, socket, sysnum::SyscallKind},
    tracee::{Tracee, TraceeTable},
};
use libc::{AT_FDCWD, AT_SYMLINK_FOLLOW, AT_SYMLINK_NOFOLLOW, IN_DONT_FOLLOW, O_CREAT, O_EXCL, O_NOFOLLOW};
use nix::{
    errno::Errno,
    sys::stat::{stat, SFlag},
    unistd::{access, AccessFlags},
};
use std::path::{Path, PathBuf};

/// Dereference the final component or not.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Follow {
    Final,
    NoFinal,
}

impl Follow {
    fn deref(self) -> bool {
        self == Follow::Final
    }

    fn unless(flags: usize, nofollow_flag: i32) -> Follow {
        if flags & nofollow_flag as usize != 0 {
            Follow::NoFinal
        } else {
            Follow::Final
        }
    }

    /// `open` creating a file exclusively must not follow a dangling link.
    fn for_open_flags(flags: usize) -> Follow {
        let flags = flags as i32;
        if flags & O_NOFOLLOW != 0 || (flags & O_EXCL != 0 && flags & O_CREAT != 0) {
            Follow::NoFinal
        } else {
            Follow::Final
        }
    }
}

fn arg(tracee: &Tracee, reg: Reg) -> usize {
    tracee.regs.peek(RegVersion::Current, reg)
}

fn dirfd_arg(tracee: &Tracee, reg: Reg) -> i32 {
    tracee.regs.peek_signed(RegVersion::Current, reg) as i32
}

/// Translate the path argument in `reg`, relative to `dirfd`, and point
/// `reg` at the host path. NULL and empty paths are left untouched.
pub fn translate_sysarg_at(
    tracee: &mut Tracee,
    others: &TraceeTable,
    dirfd: i32,
    reg: Reg,
    follow: Follow,
) -> nix::Result<Option<Translation>> {
    let path = match tracee.get_sysarg_path(reg)? {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => return Ok(None),
    };
    let translation = translate_path(tracee, others, dirfd, &path, follow.deref())?;
    tracee.set_sysarg_path(reg, &translation.host)?;
    Ok(Some(translation))
}

pub fn translate_sysarg(
    tracee: &mut Tracee,
    others: &TraceeTable,
    reg: Reg,
    follow: Follow,
) -> nix::Result<Option<Translation>> {
    translate_sysarg_at(tracee, others, AT_FDCWD, reg, follow)
}

/// Both paths are translated even if the first one fails, like the
/// kernel reports the first error.
fn translate_two(
    tracee: &mut Tracee,
    others: &TraceeTable,
    first: (i32, Reg, Follow),
    second: (i32, Reg, Follow),
) -> nix::Result<()> {
    let status1 = translate_sysarg_at(tracee, others, first.0, first.1, first.2);
    let status2 = translate_sysarg_at(tracee, others, second.0, second.1, second.2);
    status1?;
    status2?;
    Ok(())
}

/// Built-in translation at syscall entry, keyed on the current syscall
/// number (extensions may have changed it).
pub fn translate_enter(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    if tracee.regs.peek_signed(RegVersion::Current, Reg::SysargNum) < 0 {
        return Err(Errno::ENOSYS);
    }
    let kind = match tracee.sysnum(RegVersion::Current) {
        Some(kind) => kind,
        None => return Ok(()),
    };

    use SyscallKind::*;
    match kind {
        Execve => translate_execve(tracee, others),

        Chdir | Fchdir => emulate_chdir(tracee, others, kind),

        Getcwd => {
            tracee.void_syscall();
            Ok(())
        }

        Ptrace => translate_ptrace_enter(tracee),

        Wait4 | Waitpid => translate_wait_enter(tracee, others),

        Bind | Connect => socket::translate_sockaddr_enter(tracee, others),

        Accept | Accept4 | Getsockname | Getpeername => {
            socket::save_addrlen(tracee);
            Ok(())
        }

        Access | Acct | Chmod | Chown | Chown32 | Chroot | Getxattr | Listxattr | Mkdir
        | Mknod | Creat | Removexattr | Rmdir | Setxattr | Stat | Stat64 | Statfs
        | Statfs64 | Swapoff | Swapon | Truncate | Truncate64 | Umount | Umount2 | Uselib
        | Utime | Utimes => translate_sysarg(tracee, others, Reg::Sysarg1, Follow::Final).map(drop),

        Lchown | Lchown32 | Lgetxattr | Llistxattr | Lremovexattr | Lsetxattr | Lstat
        | Lstat64 | Unlink => {
            translate_sysarg(tracee, others, Reg::Sysarg1, Follow::NoFinal).map(drop)
        }

        Readlink => {
            let translation = translate_sysarg(tracee, others, Reg::Sysarg1, Follow::NoFinal)?;
            tracee.readlink_referrer = translation.map(|t| t.guest);
            Ok(())
        }

        Readlinkat => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let translation =
                translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, Follow::NoFinal)?;
            tracee.readlink_referrer = translation.map(|t| t.guest);
            Ok(())
        }

        Open => {
            let follow = Follow::for_open_flags(arg(tracee, Reg::Sysarg2));
            translate_sysarg(tracee, others, Reg::Sysarg1, follow).map(drop)
        }

        Openat => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let follow = Follow::for_open_flags(arg(tracee, Reg::Sysarg3));
            translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, follow).map(drop)
        }

        Faccessat | Fchmodat | Fchownat | Fstatat64 | Newfstatat | Utimensat => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let flags_reg = if kind == Fchownat {
                Reg::Sysarg5
            } else {
                Reg::Sysarg4
            };
            let follow = Follow::unless(arg(tracee, flags_reg), AT_SYMLINK_NOFOLLOW);
            translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, follow).map(drop)
        }

        Futimesat | Mkdirat | Mknodat => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, Follow::Final).map(drop)
        }

        Unlinkat => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, Follow::NoFinal).map(drop)
        }

        NameToHandleAt => {
            let dirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let follow = if arg(tracee, Reg::Sysarg5) & AT_SYMLINK_FOLLOW as usize != 0 {
                Follow::Final
            } else {
                Follow::NoFinal
            };
            translate_sysarg_at(tracee, others, dirfd, Reg::Sysarg2, follow).map(drop)
        }

        InotifyAddWatch => {
            let follow = Follow::unless(arg(tracee, Reg::Sysarg3), IN_DONT_FOLLOW as i32);
            translate_sysarg(tracee, others, Reg::Sysarg2, follow).map(drop)
        }

        Link | PivotRoot => translate_two(
            tracee,
            others,
            (AT_FDCWD, Reg::Sysarg1, Follow::Final),
            (AT_FDCWD, Reg::Sysarg2, Follow::Final),
        ),

        Rename => translate_two(
            tracee,
            others,
            (AT_FDCWD, Reg::Sysarg1, Follow::NoFinal),
            (AT_FDCWD, Reg::Sysarg2, Follow::NoFinal),
        ),

        Linkat => {
            let olddirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let newdirfd = dirfd_arg(tracee, Reg::Sysarg3);
            let old_follow = if arg(tracee, Reg::Sysarg5) & AT_SYMLINK_FOLLOW as usize != 0 {
                Follow::Final
            } else {
                Follow::NoFinal
            };
            translate_two(
                tracee,
                others,
                (olddirfd, Reg::Sysarg2, old_follow),
                (newdirfd, Reg::Sysarg4, Follow::Final),
            )
        }

        Renameat | Renameat2 => {
            let olddirfd = dirfd_arg(tracee, Reg::Sysarg1);
            let newdirfd = dirfd_arg(tracee, Reg::Sysarg3);
            translate_two(
                tracee,
                others,
                (olddirfd, Reg::Sysarg2, Follow::NoFinal),
                (newdirfd, Reg::Sysarg4, Follow::NoFinal),
            )
        }

        // The target of a symlink is stored as is.
        Symlink => translate_sysarg(tracee, others, Reg::Sysarg2, Follow::NoFinal).map(drop),

        Symlinkat => {
            let newdirfd = dirfd_arg(tracee, Reg::Sysarg2);
            translate_sysarg_at(tracee, others, newdirfd, Reg::Sysarg3, Follow::NoFinal).map(drop)
        }

        Mount => {
            // Only sources that look like paths; "proc", "tmpfs", "none"... are
            // not.
            if let Some(source) = tracee.get_sysarg_path(Reg::Sysarg1)? {
                let bytes = std::os::unix::ffi::OsStrExt::as_bytes(source.as_os_str());
                if bytes.first() == Some(&b'/') || bytes.first() == Some(&b'.') {
                    translate_sysarg(tracee, others, Reg::Sysarg1, Follow::Final)?;
                }
            }
            translate_sysarg(tracee, others, Reg::Sysarg2, Follow::Final).map(drop)
        }

        _ => Ok(()),
    }
}

/// `chdir` and `fchdir` only change the tracked cwd; the kernel never sees
/// them.
fn emulate_chdir(tracee: &mut Tracee, others: &TraceeTable, kind: SyscallKind) -> nix::Result<()> {
    let guest = if kind == SyscallKind::Chdir {
        let path = tracee.get_sysarg_path(Reg::Sysarg1)?.ok_or(Errno::EFAULT)?;
        if path.as_os_str().is_empty() {
            return Err(Errno::ENOENT);
        }
        let translation = translate_path(tracee, others, AT_FDCWD, &path, true)?;
        check_searchable_dir(&translation.host)?;
        translation.guest
    } else {
        let fd = dirfd_arg(tracee, Reg::Sysarg1);
        let guest = dirfd_guest_path(tracee, fd)?;
        let host = tracee.fs.borrow().bindings.guest_to_host(&guest);
        check_searchable_dir(&host)?;
        guest
    };
    tracee.void_syscall();
    // Canonical guest paths only have a trailing slash to force a
    // directory.
    let cwd: PathBuf = guest.components().collect();
    tracee.fs.borrow_mut().cwd = cwd;
    Ok(())
}

fn check_searchable_dir(host: &Path) -> nix::Result<()> {
    let st = stat(host)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
        return Err(Errno::ENOTDIR);
    }
    access(host, AccessFlags::X_OK).map_err(|_| Errno::EACCES)
}
