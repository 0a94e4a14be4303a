//! Hard links become symbolic links, for filesystems (or Android
//! sandboxes) where `link` is refused.

use crate::{
    arch::Reg,
    extension::{Event, Extension, FilteredSysnum},
    log::LogLevel::LogDebug,
    path::{binding::normalize_guest, translate::dirfd_guest_path},
    registers::RegVersion,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
};
use libc::AT_FDCWD;
use nix::errno::Errno;
use std::path::PathBuf;

pub struct Link2Symlink;

impl Link2Symlink {
    /// Absolute guest form of the old path of a `link`, which becomes the
    /// target of the symlink.
    fn link_target(tracee: &Tracee, dirfd: i32, reg: Reg) -> nix::Result<PathBuf> {
        let old = tracee.get_sysarg_path(reg)?.ok_or(Errno::EFAULT)?;
        if old.as_os_str().is_empty() {
            return Err(Errno::ENOENT);
        }
        let base = if old.is_absolute() {
            PathBuf::from("/")
        } else if dirfd == AT_FDCWD {
            tracee.fs.borrow().cwd.clone()
        } else {
            dirfd_guest_path(tracee, dirfd)?
        };
        Ok(normalize_guest(&base.join(old)))
    }

    fn enter(tracee: &mut Tracee) -> nix::Result<()> {
        match tracee.sysnum(RegVersion::Current) {
            Some(SyscallKind::Link) => {
                let target = Link2Symlink::link_target(tracee, AT_FDCWD, Reg::Sysarg1)?;
                tracee.set_sysarg_path(Reg::Sysarg1, &target)?;
                tracee.set_sysnum(SyscallKind::Symlink);
                log!(LogDebug, "pid {}: link to {:?} made symbolic", tracee.pid, target);
            }
            Some(SyscallKind::Linkat) => {
                let olddirfd = tracee.regs.peek_signed(RegVersion::Current, Reg::Sysarg1) as i32;
                let target = Link2Symlink::link_target(tracee, olddirfd, Reg::Sysarg2)?;
                // symlinkat(target, newdirfd, newpath)
                let newdirfd = tracee.regs.peek(RegVersion::Current, Reg::Sysarg3);
                let newpath = tracee.regs.peek(RegVersion::Current, Reg::Sysarg4);
                tracee.set_sysarg_path(Reg::Sysarg1, &target)?;
                tracee.regs.poke(Reg::Sysarg2, newdirfd);
                tracee.regs.poke(Reg::Sysarg3, newpath);
                tracee.set_sysnum(SyscallKind::Symlinkat);
                log!(LogDebug, "pid {}: linkat to {:?} made symbolic", tracee.pid, target);
            }
            _ => (),
        }
        Ok(())
    }
}

impl Extension for Link2Symlink {
    fn name(&self) -> &'static str {
        "link2symlink"
    }

    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        vec![
            FilteredSysnum::new(SyscallKind::Link, 0),
            FilteredSysnum::new(SyscallKind::Linkat, 0),
        ]
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64 {
        match event {
            Event::SyscallEnterStart => match Link2Symlink::enter(tracee) {
                Ok(()) => 0,
                Err(err) => -(err as i64),
            },
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::SupportedArch,
        tracee::test_support::{fake_tracee, put_string},
    };
    use std::path::Path;

    fn syscall(tracee: &mut Tracee, kind: SyscallKind, args: &[usize]) {
        tracee
            .regs
            .poke(Reg::SysargNum, kind.number(SupportedArch::X64).unwrap());
        for (i, &arg) in args.iter().enumerate() {
            tracee.regs.poke(Reg::sysarg(i + 1), arg);
        }
        tracee.regs.save_current(RegVersion::Original);
    }

    #[test]
    fn link_becomes_symlink_to_absolute_guest_path() {
        let mut tracee = fake_tracee(Path::new("/srv/rootfs"), "/home/user");
        let old = put_string(&mut tracee, 0x100, "../user/./data");
        let new = put_string(&mut tracee, 0x200, "copy");
        syscall(&mut tracee, SyscallKind::Link, &[old, new]);

        assert_eq!(0, Link2Symlink.event(&mut tracee, &mut Event::SyscallEnterStart));
        assert_eq!(Some(SyscallKind::Symlink), tracee.sysnum(RegVersion::Current));
        assert_eq!(
            Some(PathBuf::from("/home/user/data")),
            tracee.get_sysarg_path(Reg::Sysarg1).unwrap()
        );
        assert_eq!(new, tracee.regs.peek(RegVersion::Current, Reg::Sysarg2));
    }

    #[test]
    fn linkat_arguments_shift() {
        let mut tracee = fake_tracee(Path::new("/srv/rootfs"), "/");
        let old = put_string(&mut tracee, 0x100, "/etc/hosts");
        let new = put_string(&mut tracee, 0x200, "hosts");
        syscall(&mut tracee, SyscallKind::Linkat, &[AT_FDCWD as usize, old, 7, new, 0]);

        assert_eq!(0, Link2Symlink.event(&mut tracee, &mut Event::SyscallEnterStart));
        assert_eq!(Some(SyscallKind::Symlinkat), tracee.sysnum(RegVersion::Current));
        assert_eq!(
            Some(PathBuf::from("/etc/hosts")),
            tracee.get_sysarg_path(Reg::Sysarg1).unwrap()
        );
        assert_eq!(7, tracee.regs.peek(RegVersion::Current, Reg::Sysarg2));
        assert_eq!(new, tracee.regs.peek(RegVersion::Current, Reg::Sysarg3));
    }

    #[test]
    fn empty_old_path() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let old = put_string(&mut tracee, 0x100, "");
        syscall(&mut tracee, SyscallKind::Link, &[old, old]);
        assert_eq!(
            -(libc::ENOENT as i64),
            Link2Symlink.event(&mut tracee, &mut Event::SyscallEnterStart)
        );
    }
}
