//! Copy-on-write for hard links: a file opened for writing gets its own
//! copy first, so that the other names of the inode keep the old content.

use crate::{
    arch::Reg,
    extension::{Event, Extension, FilteredSysnum},
    log::LogLevel::{LogDebug, LogWarn},
    registers::RegVersion,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
};
use libc::{O_ACCMODE, O_RDONLY, S_IFMT, S_IFREG};
use nix::{errno::Errno, sys::stat::lstat};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

pub struct Cow;

impl Cow {
    /// Host path opened for writing by the current syscall, if any.
    fn written_path(tracee: &Tracee) -> nix::Result<Option<PathBuf>> {
        let (path_reg, flags_reg) = match tracee.sysnum(RegVersion::Current) {
            Some(SyscallKind::Open) => (Reg::Sysarg1, Reg::Sysarg2),
            Some(SyscallKind::Openat) => (Reg::Sysarg2, Reg::Sysarg3),
            _ => return Ok(None),
        };
        let flags = tracee.regs.peek(RegVersion::Current, flags_reg) as i32;
        if flags & O_ACCMODE == O_RDONLY {
            return Ok(None);
        }
        tracee.get_sysarg_path(path_reg)
    }
}

fn io_errno(err: io::Error) -> Errno {
    Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Give `host` an inode of its own if it shares one with other names.
fn break_link(host: &Path, pid: libc::pid_t) -> nix::Result<bool> {
    let st = match lstat(host) {
        Ok(st) => st,
        Err(Errno::ENOENT) => return Ok(false),
        Err(err) => return Err(err),
    };
    if st.st_mode & S_IFMT != S_IFREG || st.st_nlink < 2 {
        return Ok(false);
    }
    let name = host.file_name().ok_or(Errno::EISDIR)?;
    let mut copy_name = OsString::from(".");
    copy_name.push(name);
    copy_name.push(format!(".vroot-cow-{}", pid));
    let copy = host.with_file_name(copy_name);

    // fs::copy keeps the permission bits.
    fs::copy(host, &copy).map_err(io_errno)?;
    if let Err(err) = fs::rename(&copy, host) {
        let _ = fs::remove_file(&copy);
        return Err(io_errno(err));
    }
    Ok(true)
}

impl Extension for Cow {
    fn name(&self) -> &'static str {
        "cow"
    }

    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        vec![
            FilteredSysnum::new(SyscallKind::Open, 0),
            FilteredSysnum::new(SyscallKind::Openat, 0),
        ]
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64 {
        match event {
            Event::SyscallEnterEnd { status } if *status >= 0 => {
                let result = Cow::written_path(tracee).and_then(|host| match host {
                    Some(host) => break_link(&host, tracee.pid).map(|broken| (host, broken)),
                    None => Ok((PathBuf::new(), false)),
                });
                match result {
                    Ok((host, true)) => {
                        log!(LogDebug, "pid {}: hard link {:?} copied", tracee.pid, host);
                        0
                    }
                    Ok(_) => 0,
                    Err(err) => {
                        log!(LogWarn, "pid {}: can't break hard link: {}", tracee.pid, err);
                        -(err as i64)
                    }
                }
            }
            _ => 0,
        }
    }
}
