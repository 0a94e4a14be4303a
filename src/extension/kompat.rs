//! Pretend to run on another kernel release.
//!
//! `uname` reports the emulated release, and syscalls the emulated kernel
//! has but the host kernel lacks are replaced by their older equivalents.

use crate::{
    arch::Reg,
    extension::{Event, Extension, ExtensionHandle, FilteredSysnum, FILTER_SYSEXIT},
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    registers::RegVersion,
    remote_ptr::RemotePtr,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
    util::{host_kernel_release, kernel_version, parse_kernel_release},
};
use libc::{AT_REMOVEDIR, AT_SYMLINK_NOFOLLOW, EINVAL, FD_CLOEXEC, F_SETFD, F_SETFL, O_CLOEXEC, O_NONBLOCK};
use std::{cell::RefCell, env, rc::Rc};

/// Length of the fields of `struct utsname`, terminator included.
const UTSNAME_FIELD_SIZE: usize = 65;

bitflags! {
    /// Descriptor flags the replacement syscall can't take.
    pub struct FdFlags: u32 {
        const CLOEXEC = 1;
        const NONBLOCK = 2;
    }
}

impl FdFlags {
    /// `SOCK_*`, `EFD_*`, `IN_*` and `EPOLL_CLOEXEC` share the `O_*` values.
    fn from_open_flags(flags: usize) -> FdFlags {
        let flags = flags as i32;
        let mut result = FdFlags::empty();
        if flags & O_CLOEXEC != 0 {
            result |= FdFlags::CLOEXEC;
        }
        if flags & O_NONBLOCK != 0 {
            result |= FdFlags::NONBLOCK;
        }
        result
    }
}

/// Where the new descriptors of the replacement syscall end up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NewFds {
    /// The syscall result.
    Result,
    /// An `int[2]` in tracee memory, as for `pipe`.
    Pair(usize),
}

pub struct Kompat {
    release: String,
    virtual_version: u32,
    host_version: u32,
    /// Every shim applies, whatever the host kernel.
    force: bool,
    pending: Option<(NewFds, FdFlags)>,
}

impl Kompat {
    pub fn new(release: &str) -> Kompat {
        let host = host_kernel_release();
        let force = env::var_os("VROOT_FORCE_KOMPAT").is_some();
        log!(LogInfo, "emulating kernel {} on {}", release, host);
        Kompat::with_host(release, parse_kernel_release(&host), force)
    }

    fn with_host(release: &str, host_version: u32, force: bool) -> Kompat {
        Kompat {
            release: release.to_owned(),
            virtual_version: parse_kernel_release(release),
            host_version,
            force,
            pending: None,
        }
    }

    /// A syscall introduced in `introduced` has to be emulated.
    fn needs(&self, introduced: u32) -> bool {
        self.force || (self.host_version < introduced && self.virtual_version >= introduced)
    }

    /// Replace a descriptor-creating syscall by its flag-less ancestor.
    fn enter_fd_syscall(&mut self, tracee: &mut Tracee, kind: SyscallKind) -> i64 {
        use SyscallKind::*;
        let arg = |reg| tracee.regs.peek(RegVersion::Current, reg);
        let (introduced, replacement, flags_reg, new_fds) = match kind {
            Dup3 => (kernel_version(2, 6, 27), Dup2, Reg::Sysarg3, NewFds::Result),
            Pipe2 => (
                kernel_version(2, 6, 27),
                Pipe,
                Reg::Sysarg2,
                NewFds::Pair(arg(Reg::Sysarg1)),
            ),
            Eventfd2 => (kernel_version(2, 6, 27), Eventfd, Reg::Sysarg2, NewFds::Result),
            Signalfd4 => (kernel_version(2, 6, 27), Signalfd, Reg::Sysarg4, NewFds::Result),
            InotifyInit1 => (kernel_version(2, 6, 27), InotifyInit, Reg::Sysarg1, NewFds::Result),
            EpollCreate1 => (kernel_version(2, 6, 27), EpollCreate, Reg::Sysarg1, NewFds::Result),
            Accept4 => (kernel_version(2, 6, 28), Accept, Reg::Sysarg4, NewFds::Result),
            _ => return 0,
        };
        if !self.needs(introduced) || replacement.number(tracee.regs.arch()).is_none() {
            return 0;
        }
        if kind == Dup3 && arg(Reg::Sysarg1) == arg(Reg::Sysarg2) {
            return -(EINVAL as i64);
        }
        let flags = FdFlags::from_open_flags(arg(flags_reg));
        log!(LogDebug, "pid {}: {} replaced by {}", tracee.pid, kind.name(), replacement.name());
        tracee.set_sysnum(replacement);
        if kind == EpollCreate1 {
            // The size only has to be positive.
            tracee.regs.poke(Reg::Sysarg1, 1);
        }
        self.pending = Some((new_fds, flags));
        0
    }

    /// The `*at` syscall got absolute host paths: the plain syscall does the
    /// same job.
    fn enter_at_syscall(&self, tracee: &mut Tracee) {
        use SyscallKind::*;
        let kind = match tracee.sysnum(RegVersion::Current) {
            Some(kind) => kind,
            None => return,
        };
        let arg = |reg| tracee.regs.peek(RegVersion::Current, reg);
        let nofollow = |reg| arg(reg) & AT_SYMLINK_NOFOLLOW as usize != 0;
        let (replacement, args, paths): (SyscallKind, &[Reg], &[Reg]) = match kind {
            Openat => (Open, &[Reg::Sysarg2, Reg::Sysarg3, Reg::Sysarg4], &[Reg::Sysarg2]),
            Mkdirat => (Mkdir, &[Reg::Sysarg2, Reg::Sysarg3], &[Reg::Sysarg2]),
            Mknodat => (Mknod, &[Reg::Sysarg2, Reg::Sysarg3, Reg::Sysarg4], &[Reg::Sysarg2]),
            Fchownat => (
                if nofollow(Reg::Sysarg5) { Lchown } else { Chown },
                &[Reg::Sysarg2, Reg::Sysarg3, Reg::Sysarg4],
                &[Reg::Sysarg2],
            ),
            Futimesat => (Utimes, &[Reg::Sysarg2, Reg::Sysarg3], &[Reg::Sysarg2]),
            Newfstatat => (
                if nofollow(Reg::Sysarg4) { Lstat } else { Stat },
                &[Reg::Sysarg2, Reg::Sysarg3],
                &[Reg::Sysarg2],
            ),
            Fstatat64 => (
                if nofollow(Reg::Sysarg4) { Lstat64 } else { Stat64 },
                &[Reg::Sysarg2, Reg::Sysarg3],
                &[Reg::Sysarg2],
            ),
            Unlinkat => (
                if arg(Reg::Sysarg3) & AT_REMOVEDIR as usize != 0 {
                    Rmdir
                } else {
                    Unlink
                },
                &[Reg::Sysarg2],
                &[Reg::Sysarg2],
            ),
            Renameat => (Rename, &[Reg::Sysarg2, Reg::Sysarg4], &[Reg::Sysarg2, Reg::Sysarg4]),
            Linkat => (Link, &[Reg::Sysarg2, Reg::Sysarg4], &[Reg::Sysarg2, Reg::Sysarg4]),
            Symlinkat => (Symlink, &[Reg::Sysarg1, Reg::Sysarg3], &[Reg::Sysarg3]),
            Readlinkat => (Readlink, &[Reg::Sysarg2, Reg::Sysarg3, Reg::Sysarg4], &[Reg::Sysarg2]),
            Fchmodat => (Chmod, &[Reg::Sysarg2, Reg::Sysarg3], &[Reg::Sysarg2]),
            Faccessat => (Access, &[Reg::Sysarg2, Reg::Sysarg3], &[Reg::Sysarg2]),
            _ => return,
        };
        if replacement.number(tracee.regs.arch()).is_none() {
            return;
        }
        // An empty or NULL path means the dirfd itself is the target.
        let absolute = paths.iter().all(|&reg| match tracee.get_sysarg_path(reg) {
            Ok(Some(path)) => path.is_absolute(),
            _ => false,
        });
        if !absolute {
            return;
        }
        let values: Vec<usize> = args.iter().map(|&reg| arg(reg)).collect();
        tracee.set_sysnum(replacement);
        for (i, value) in values.into_iter().enumerate() {
            tracee.regs.poke(Reg::sysarg(i + 1), value);
        }
    }

    /// Apply the flags the replacement syscall couldn't take, through
    /// chained `fcntl`s.
    fn exit_fd_syscall(&mut self, tracee: &mut Tracee) -> nix::Result<()> {
        let (new_fds, flags) = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        if tracee.regs.syscall_failed() || flags.is_empty() {
            return Ok(());
        }
        let result = tracee.regs.syscall_result_signed();
        let fds = match new_fds {
            NewFds::Result => vec![result as usize],
            NewFds::Pair(addr) => {
                let mut raw = [0u8; 8];
                tracee.read_data(RemotePtr::from(addr), &mut raw)?;
                vec![
                    i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize,
                    i32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize,
                ]
            }
        };
        for fd in fds {
            if flags.contains(FdFlags::CLOEXEC) {
                tracee.register_chained_syscall(
                    SyscallKind::Fcntl,
                    [fd, F_SETFD as usize, FD_CLOEXEC as usize, 0, 0, 0],
                )?;
            }
            if flags.contains(FdFlags::NONBLOCK) {
                tracee.register_chained_syscall(
                    SyscallKind::Fcntl,
                    [fd, F_SETFL as usize, O_NONBLOCK as usize, 0, 0, 0],
                )?;
            }
        }
        tracee.force_chain_final_result(result);
        Ok(())
    }

    fn fake_uname(&self, tracee: &mut Tracee) -> nix::Result<()> {
        let buf = tracee.regs.peek(RegVersion::Original, Reg::Sysarg1);
        let mut release = self.release.as_bytes().to_vec();
        release.truncate(UTSNAME_FIELD_SIZE - 1);
        release.push(0);
        let addr = buf + offset_of!(libc::utsname, release);
        tracee.write_data(RemotePtr::from(addr), &release)
    }
}

impl Extension for Kompat {
    fn name(&self) -> &'static str {
        "kompat"
    }

    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        use SyscallKind::*;
        let emulated = [Uname, Dup3, Pipe2, Eventfd2, Signalfd4, InotifyInit1, EpollCreate1, Accept4]
            .iter()
            .map(|&kind| FilteredSysnum::new(kind, FILTER_SYSEXIT));
        let at_syscalls = [
            Openat, Mkdirat, Mknodat, Fchownat, Futimesat, Newfstatat, Fstatat64, Unlinkat, Renameat,
            Linkat, Symlinkat, Readlinkat, Fchmodat, Faccessat,
        ]
        .iter()
        .map(|&kind| FilteredSysnum::new(kind, 0));
        emulated.chain(at_syscalls).collect()
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64 {
        match event {
            Event::InheritParent => 1,

            Event::SyscallEnterStart => {
                self.pending = None;
                match tracee.sysnum(RegVersion::Current) {
                    Some(kind) => self.enter_fd_syscall(tracee, kind),
                    None => 0,
                }
            }

            Event::SyscallEnterEnd { status } if *status >= 0 => {
                if self.needs(kernel_version(2, 6, 16)) {
                    self.enter_at_syscall(tracee);
                }
                0
            }

            Event::SyscallExitEnd => {
                let result = if tracee.sysnum(RegVersion::Original) == Some(SyscallKind::Uname) {
                    if tracee.regs.syscall_failed() {
                        Ok(())
                    } else {
                        self.fake_uname(tracee)
                    }
                } else {
                    self.exit_fd_syscall(tracee)
                };
                if let Err(err) = result {
                    log!(LogWarn, "pid {}: {} not emulated: {}", tracee.pid, tracee.syscall_name(), err);
                }
                0
            }

            _ => 0,
        }
    }

    fn new_instance(&self) -> Option<ExtensionHandle> {
        Some(Rc::new(RefCell::new(Kompat {
            release: self.release.clone(),
            virtual_version: self.virtual_version,
            host_version: self.host_version,
            force: self.force,
            pending: None,
        })))
    }
}
