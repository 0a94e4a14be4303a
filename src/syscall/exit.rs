use crate::{
    arch::Reg,
    path::{canon::ProcLink, proc::proc_link, translate::detranslate_bytes},
    ptrace::{translate_ptrace_exit, wait::translate_wait_exit},
    registers::RegVersion,
    remote_ptr::RemotePtr,
    syscall::{socket, sysnum::SyscallKind},
    tracee::{Tracee, TraceeTable},
};
use nix::errno::Errno;
use std::{cmp::min, os::unix::ffi::OsStrExt, path::Path};

/// Built-in translation at syscall exit, keyed on the syscall the tracee
/// originally made. Only called when the entry stage succeeded.
pub fn translate_exit(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    let kind = match tracee.sysnum(RegVersion::Original) {
        Some(kind) => kind,
        None => return Ok(()),
    };

    use SyscallKind::*;
    match kind {
        Getcwd => emulate_getcwd(tracee),

        Chdir | Fchdir => {
            tracee.regs.poke(Reg::SysargResult, 0);
            Ok(())
        }

        Readlink | Readlinkat => translate_readlink_exit(tracee, others, kind),

        Accept | Accept4 | Getsockname | Getpeername => socket::translate_sockaddr_exit(tracee),

        Execve => {
            let new_exe = tracee.new_exe.take();
            if !tracee.regs.syscall_failed() {
                tracee.exe = new_exe;
            }
            Ok(())
        }

        Ptrace => translate_ptrace_exit(tracee, others),

        Wait4 | Waitpid => translate_wait_exit(tracee, others),

        _ => Ok(()),
    }
}

fn emulate_getcwd(tracee: &mut Tracee) -> nix::Result<()> {
    let mut cwd = tracee.fs.borrow().cwd.as_os_str().as_bytes().to_vec();
    cwd.push(0);
    let buf = tracee.regs.peek(RegVersion::Original, Reg::Sysarg1);
    let size = tracee.regs.peek(RegVersion::Original, Reg::Sysarg2);
    if size < cwd.len() {
        return Err(Errno::ERANGE);
    }
    tracee.write_data(RemotePtr::from(buf), &cwd)?;
    tracee.regs.poke(Reg::SysargResult, cwd.len());
    Ok(())
}

/// The kernel wrote a host path: give the tracee the guest one, clamped
/// to its buffer like readlink(2) does.
fn translate_readlink_exit(tracee: &mut Tracee, others: &TraceeTable, kind: SyscallKind) -> nix::Result<()> {
    let referrer = match tracee.readlink_referrer.take() {
        Some(referrer) => referrer,
        None => return Ok(()),
    };
    let (buf_reg, size_reg) = if kind == SyscallKind::Readlink {
        (Reg::Sysarg2, Reg::Sysarg3)
    } else {
        (Reg::Sysarg3, Reg::Sysarg4)
    };
    let buf = tracee.regs.peek(RegVersion::Original, buf_reg);
    let size = tracee.regs.peek(RegVersion::Original, size_reg);

    // Already right: the kernel resolved it for the calling pid.
    if referrer != Path::new("/proc/self") {
        match proc_link(tracee, others, &referrer)? {
            Some(ProcLink::Target(target)) => {
                return write_link(tracee, buf, size, target.as_os_str().as_bytes());
            }
            Some(ProcLink::Opaque) => return Ok(()),
            None => {}
        }
    }

    if tracee.regs.syscall_failed() {
        return Ok(());
    }
    let len = tracee.regs.syscall_result_signed() as usize;
    // Truncated: there's no telling what the full target was.
    if len >= size {
        return Ok(());
    }
    let mut host = vec![0u8; len];
    tracee.read_data(RemotePtr::from(buf), &mut host)?;

    let bindings = tracee.fs.borrow().bindings.clone();
    let referrer_host = bindings.guest_to_host(&referrer);
    match detranslate_bytes(&bindings, &host, Some(&referrer_host)) {
        Some(guest) => write_link(tracee, buf, size, &guest),
        None => Ok(()),
    }
}

fn write_link(tracee: &mut Tracee, buf: usize, size: usize, target: &[u8]) -> nix::Result<()> {
    let len = min(target.len(), size);
    tracee.write_data(RemotePtr::from(buf), &target[..len])?;
    tracee.regs.poke(Reg::SysargResult, len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::SupportedArch,
        tracee::test_support::{fake_tracee, STACK_BASE},
    };
    use std::path::PathBuf;

    fn exiting(tracee: &mut Tracee, kind: SyscallKind, args: &[usize], result: isize) {
        tracee
            .regs
            .poke(Reg::SysargNum, kind.number(SupportedArch::X64).unwrap());
        for (i, &arg) in args.iter().enumerate() {
            tracee.regs.poke(Reg::sysarg(i + 1), arg);
        }
        tracee.regs.save_current(RegVersion::Original);
        tracee.regs.poke_signed(Reg::SysargResult, result);
    }

    fn read(tracee: &Tracee, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tracee.read_data(RemotePtr::from(addr), &mut buf).unwrap();
        buf
    }

    #[test]
    fn getcwd_reports_guest_cwd() {
        let mut tracee = fake_tracee(Path::new("/tmp"), "/home/user");
        exiting(&mut tracee, SyscallKind::Getcwd, &[STACK_BASE, 64], -libc::ENOSYS as isize);
        translate_exit(&mut tracee, &mut TraceeTable::new()).unwrap();
        assert_eq!(11, tracee.regs.syscall_result_signed());
        assert_eq!(b"/home/user\0".to_vec(), read(&tracee, STACK_BASE, 11));

        exiting(&mut tracee, SyscallKind::Getcwd, &[STACK_BASE, 5], -libc::ENOSYS as isize);
        assert_eq!(Err(Errno::ERANGE), translate_exit(&mut tracee, &mut TraceeTable::new()));
    }

    #[test]
    fn readlink_target_detranslated() {
        let mut tracee = fake_tracee(Path::new("/srv/rootfs"), "/");
        let target = b"/srv/rootfs/usr/lib";
        tracee.write_data(RemotePtr::from(STACK_BASE), target).unwrap();
        exiting(
            &mut tracee,
            SyscallKind::Readlink,
            &[0, STACK_BASE, 64],
            target.len() as isize,
        );
        tracee.readlink_referrer = Some(PathBuf::from("/lib"));
        translate_exit(&mut tracee, &mut TraceeTable::new()).unwrap();
        assert_eq!(8, tracee.regs.syscall_result_signed());
        assert_eq!(b"/usr/lib".to_vec(), read(&tracee, STACK_BASE, 8));
    }

    #[test]
    fn readlink_of_emulated_proc_link() {
        let mut tracee = fake_tracee(Path::new("/srv/rootfs"), "/");
        tracee.exe = Some(PathBuf::from("/usr/bin/python3"));
        exiting(&mut tracee, SyscallKind::Readlinkat, &[0, 0, STACK_BASE, 8], -2);
        tracee.readlink_referrer = Some(PathBuf::from("/proc/4242/exe"));
        translate_exit(&mut tracee, &mut TraceeTable::new()).unwrap();
        // Clamped to the buffer, no terminator.
        assert_eq!(8, tracee.regs.syscall_result_signed());
        assert_eq!(b"/usr/bin".to_vec(), read(&tracee, STACK_BASE, 8));
    }

    #[test]
    fn execve_promotes_exe_on_success_only() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.new_exe = Some(PathBuf::from("/bin/ls"));
        exiting(&mut tracee, SyscallKind::Execve, &[], -(libc::ENOENT as isize));
        translate_exit(&mut tracee, &mut TraceeTable::new()).unwrap();
        assert_eq!(None, tracee.exe);

        tracee.new_exe = Some(PathBuf::from("/bin/ls"));
        exiting(&mut tracee, SyscallKind::Execve, &[], 0);
        translate_exit(&mut tracee, &mut TraceeTable::new()).unwrap();
        assert_eq!(Some(PathBuf::from("/bin/ls")), tracee.exe);
        assert_eq!(None, tracee.new_exe);
    }
}
