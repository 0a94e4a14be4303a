//! Executable file mappings turned into anonymous memory filled with the
//! file content, for hosts that mount the guest `noexec`.

use crate::{
    arch::Reg,
    extension::{Event, Extension, ExtensionHandle, FilteredSysnum, FILTER_SYSEXIT},
    log::LogLevel::{LogDebug, LogWarn},
    registers::RegVersion,
    remote_ptr::RemotePtr,
    scoped_fd::ScopedFd,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
    util::page_size,
};
use libc::{pid_t, MAP_ANONYMOUS, MAP_PRIVATE, MAP_SHARED, PROT_EXEC, PROT_WRITE};
use nix::{fcntl::OFlag, sys::uio::pread};
use std::{cell::RefCell, rc::Rc};

/// A file mapping replaced by an anonymous one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Mapping {
    fd: i32,
    offset: u64,
    length: usize,
    prot: usize,
}

#[derive(Default)]
pub struct MmapNoexec {
    pending: Option<Mapping>,
}

impl MmapNoexec {
    pub fn new() -> MmapNoexec {
        Self::default()
    }

    fn enter(&mut self, tracee: &mut Tracee, kind: SyscallKind) {
        let arg = |reg| tracee.regs.peek(RegVersion::Current, reg);
        let prot = arg(Reg::Sysarg3);
        let flags = arg(Reg::Sysarg4) as i32;
        let fd = arg(Reg::Sysarg5) as i32;
        if prot & PROT_EXEC as usize == 0 || flags & MAP_ANONYMOUS != 0 || fd < 0 {
            return;
        }
        let offset = if kind == SyscallKind::Mmap2 {
            arg(Reg::Sysarg6) as u64 * page_size() as u64
        } else {
            arg(Reg::Sysarg6) as u64
        };
        let mapping = Mapping {
            fd,
            offset,
            length: arg(Reg::Sysarg2),
            prot,
        };
        let flags = (flags & !(MAP_SHARED | MAP_PRIVATE)) | MAP_PRIVATE | MAP_ANONYMOUS;
        tracee.regs.poke(Reg::Sysarg3, prot | PROT_WRITE as usize);
        tracee.regs.poke(Reg::Sysarg4, flags as u32 as usize);
        tracee.regs.poke_signed(Reg::Sysarg5, -1);
        tracee.regs.poke(Reg::Sysarg6, 0);
        log!(LogDebug, "pid {}: mapping of fd {} made anonymous", tracee.pid, fd);
        self.pending = Some(mapping);
    }

    fn exit(&mut self, tracee: &mut Tracee) -> nix::Result<()> {
        let mapping = match self.pending.take() {
            Some(mapping) => mapping,
            None => return Ok(()),
        };
        if tracee.regs.syscall_failed() {
            return Ok(());
        }
        let addr = tracee.regs.syscall_result_signed() as usize;
        copy_file_content(tracee, &mapping, addr)?;
        if mapping.prot & PROT_WRITE as usize == 0 {
            tracee.register_chained_syscall(
                SyscallKind::Mprotect,
                [addr, mapping.length, mapping.prot, 0, 0, 0],
            )?;
            tracee.force_chain_final_result(addr as isize);
        }
        Ok(())
    }
}

fn fd_path(pid: pid_t, fd: i32) -> String {
    format!("/proc/{}/fd/{}", pid, fd)
}

/// Copy the mapped part of the file at `addr`. The rest of the mapping,
/// past the end of the file, stays zero.
fn copy_file_content(tracee: &mut Tracee, mapping: &Mapping, addr: usize) -> nix::Result<()> {
    let file = ScopedFd::open_path(fd_path(tracee.pid, mapping.fd).as_str(), OFlag::O_RDONLY)?;
    let mut buf = vec![0u8; page_size()];
    let mut copied = 0;
    while copied < mapping.length {
        let wanted = buf.len().min(mapping.length - copied);
        let offset = mapping.offset + copied as u64;
        let n = pread(file.as_raw(), &mut buf[..wanted], offset as libc::off_t)?;
        if n == 0 {
            break;
        }
        tracee.write_data(RemotePtr::from(addr + copied), &buf[..n])?;
        copied += n;
    }
    Ok(())
}

impl Extension for MmapNoexec {
    fn name(&self) -> &'static str {
        "mmap_noexec"
    }

    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        vec![
            FilteredSysnum::new(SyscallKind::Mmap, FILTER_SYSEXIT),
            FilteredSysnum::new(SyscallKind::Mmap2, FILTER_SYSEXIT),
        ]
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64 {
        match event {
            Event::InheritParent => 1,
            Event::SyscallEnterStart => {
                self.pending = None;
                match tracee.sysnum(RegVersion::Current) {
                    Some(kind @ SyscallKind::Mmap) | Some(kind @ SyscallKind::Mmap2) => {
                        self.enter(tracee, kind)
                    }
                    _ => (),
                }
                0
            }
            Event::SyscallExitEnd => {
                if let Err(err) = self.exit(tracee) {
                    log!(LogWarn, "pid {}: can't fill anonymous mapping: {}", tracee.pid, err);
                }
                0
            }
            _ => 0,
        }
    }

    fn new_instance(&self) -> Option<ExtensionHandle> {
        Some(Rc::new(RefCell::new(MmapNoexec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::SupportedArch,
        tracee::test_support::{fake_tracee, STACK_BASE},
        util::scratch_dir,
    };
    use libc::{PROT_READ, SYS_mprotect};
    use std::{fs, os::unix::io::AsRawFd, path::Path};

    fn mmap(tracee: &mut Tracee, args: &[usize]) {
        let nr = SyscallKind::Mmap.number(SupportedArch::X64).unwrap();
        tracee.regs.poke(Reg::SysargNum, nr);
        for (i, &arg) in args.iter().enumerate() {
            tracee.regs.poke(Reg::sysarg(i + 1), arg);
        }
        tracee.regs.save_current(RegVersion::Original);
    }

    #[test]
    fn executable_file_mapping_is_copied() {
        let dir = scratch_dir("mmap-noexec");
        let path = dir.join("lib.so");
        fs::write(&path, b"0123456789").unwrap();
        let file = fs::File::open(&path).unwrap();

        let mut ext = MmapNoexec::new();
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.pid = std::process::id() as pid_t;
        let prot = (PROT_READ | PROT_EXEC) as usize;
        mmap(&mut tracee, &[0, 0x1000, prot, MAP_PRIVATE as usize, file.as_raw_fd() as usize, 2]);

        ext.event(&mut tracee, &mut Event::SyscallEnterStart);
        let current = |reg| tracee.regs.peek(RegVersion::Current, reg);
        assert_eq!(prot | PROT_WRITE as usize, current(Reg::Sysarg3));
        assert_ne!(0, current(Reg::Sysarg4) as i32 & MAP_ANONYMOUS);
        assert_eq!(-1, tracee.regs.peek_signed(RegVersion::Current, Reg::Sysarg5));

        tracee.regs.poke(Reg::SysargResult, STACK_BASE);
        ext.event(&mut tracee, &mut Event::SyscallExitEnd);
        let mut copied = [0u8; 9];
        tracee.read_data(RemotePtr::from(STACK_BASE), &mut copied).unwrap();
        // Only up to the end of the file.
        assert_eq!(b"23456789\xaa", &copied);

        assert_eq!(1, tracee.chain.queue.len());
        assert_eq!(SYS_mprotect as usize, tracee.chain.queue[0].sysnum);
        assert_eq!([STACK_BASE, 0x1000, prot, 0, 0, 0], tracee.chain.queue[0].args);
        assert_eq!(Some(STACK_BASE as isize), tracee.chain.final_result);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn anonymous_and_data_mappings_untouched() {
        let mut ext = MmapNoexec::new();
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let anonymous = (MAP_PRIVATE | MAP_ANONYMOUS) as usize;
        mmap(&mut tracee, &[0, 0x1000, PROT_EXEC as usize, anonymous, usize::MAX, 0]);
        ext.event(&mut tracee, &mut Event::SyscallEnterStart);
        assert!(ext.pending.is_none());

        mmap(&mut tracee, &[0, 0x1000, PROT_READ as usize, MAP_PRIVATE as usize, 3, 0]);
        ext.event(&mut tracee, &mut Event::SyscallEnterStart);
        assert!(ext.pending.is_none());
        assert_eq!(3, tracee.regs.peek(RegVersion::Current, Reg::Sysarg5));
    }
}
