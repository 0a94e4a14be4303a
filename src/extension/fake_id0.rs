//! Fake user and group ids.
//!
//! The tracees believe they run under the configured ids (root with
//! `-0`). Credential syscalls are emulated against a per-process copy of
//! the fake credentials and never reach the kernel; operations only root
//! could do succeed silently; files of the real user look owned by the
//! fake one.

use crate::{
    arch::{Reg, SupportedArch},
    extension::{is_filtered, Event, Extension, ExtensionHandle, FilteredSysnum, FILTER_SYSEXIT},
    log::LogLevel::LogDebug,
    registers::RegVersion,
    remote_ptr::RemotePtr,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
};
use libc::{EPERM, S_IFDIR, S_IFLNK, S_IFMT, S_IRUSR, S_IRWXU, S_IWUSR};
use nix::{
    sys::stat::lstat,
    unistd::{getgid, getuid},
};
use std::{
    cell::RefCell,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    rc::Rc,
};

/// `-1` as a `uid_t` argument: leave this id unchanged.
const UNCHANGED: u32 = u32::MAX;

/// Offsets of `st_uid` and `st_gid` in the i386 `struct stat64`.
const STAT64_UID_OFFSET: usize = 24;
const STAT64_GID_OFFSET: usize = 28;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdKind {
    Uid,
    Gid,
}

/// Real, effective, saved and filesystem ids of one kind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdSet {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
    pub fs: u32,
}

impl IdSet {
    fn new(id: u32) -> IdSet {
        IdSet {
            real: id,
            effective: id,
            saved: id,
            fs: id,
        }
    }

    fn is_current(&self, id: u32) -> bool {
        id == self.real || id == self.effective || id == self.saved
    }

    /// `setuid(2)`: a privileged caller sets every id, anybody else only
    /// the effective one, to its real or saved id.
    fn set(&mut self, id: u32, privileged: bool) -> Result<(), i32> {
        if privileged {
            *self = IdSet::new(id);
        } else if id == self.real || id == self.saved {
            self.effective = id;
            self.fs = id;
        } else {
            return Err(EPERM);
        }
        Ok(())
    }

    /// `setreuid(2)`.
    fn set_re(&mut self, real: u32, effective: u32, privileged: bool) -> Result<(), i32> {
        if !privileged {
            if real != UNCHANGED && real != self.real && real != self.effective {
                return Err(EPERM);
            }
            if effective != UNCHANGED && !self.is_current(effective) {
                return Err(EPERM);
            }
        }
        let old_real = self.real;
        if real != UNCHANGED {
            self.real = real;
        }
        if effective != UNCHANGED {
            self.effective = effective;
        }
        if real != UNCHANGED || (effective != UNCHANGED && effective != old_real) {
            self.saved = self.effective;
        }
        self.fs = self.effective;
        Ok(())
    }

    /// `setresuid(2)`.
    fn set_res(&mut self, real: u32, effective: u32, saved: u32, privileged: bool) -> Result<(), i32> {
        if !privileged
            && [real, effective, saved]
                .iter()
                .any(|&id| id != UNCHANGED && !self.is_current(id))
        {
            return Err(EPERM);
        }
        if real != UNCHANGED {
            self.real = real;
        }
        if effective != UNCHANGED {
            self.effective = effective;
        }
        if saved != UNCHANGED {
            self.saved = saved;
        }
        self.fs = self.effective;
        Ok(())
    }

    /// `setfsuid(2)`: always returns the previous value, changes it only
    /// when allowed.
    fn set_fs(&mut self, id: u32, privileged: bool) -> u32 {
        let old = self.fs;
        if privileged || self.is_current(id) || id == self.fs {
            self.fs = id;
        }
        old
    }
}

/// Restores the mode of a file whose permissions were widened for one
/// syscall.
pub struct PermissionGuard {
    path: PathBuf,
    mode: u32,
}

impl PermissionGuard {
    /// Add `wanted` to the owner bits of `path`, if they aren't there yet.
    fn widen(path: &Path, wanted: u32) -> Option<PermissionGuard> {
        let st = lstat(path).ok()?;
        let file_type = st.st_mode & S_IFMT;
        if file_type == S_IFLNK || st.st_uid != getuid().as_raw() {
            return None;
        }
        let mode = st.st_mode & 0o7777;
        if mode & wanted == wanted {
            return None;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(mode | wanted)).ok()?;
        log!(LogDebug, "mode of {:?} widened from {:o}", path, mode);
        Some(PermissionGuard {
            path: path.to_path_buf(),
            mode,
        })
    }
}

impl Drop for PermissionGuard {
    fn drop(&mut self) {
        let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode));
    }
}

pub struct FakeId0 {
    pub uids: IdSet,
    pub gids: IdSet,
    /// Result of the emulated syscall, set at its exit.
    result: Option<isize>,
    guards: Vec<PermissionGuard>,
}

impl FakeId0 {
    pub fn new(uid: u32, gid: u32) -> FakeId0 {
        FakeId0 {
            uids: IdSet::new(uid),
            gids: IdSet::new(gid),
            result: None,
            guards: Vec::new(),
        }
    }

    fn privileged(&self) -> bool {
        self.uids.effective == 0
    }

    fn ids_mut(&mut self, kind: IdKind) -> &mut IdSet {
        match kind {
            IdKind::Uid => &mut self.uids,
            IdKind::Gid => &mut self.gids,
        }
    }

    /// The emulated result of a credential syscall, `None` for syscalls
    /// left to the kernel.
    fn emulate_enter(&mut self, tracee: &mut Tracee, kind: SyscallKind) -> Option<Result<isize, i32>> {
        let arg = |reg| tracee.regs.peek(RegVersion::Current, reg) as u32;
        let (a1, a2, a3) = (arg(Reg::Sysarg1), arg(Reg::Sysarg2), arg(Reg::Sysarg3));
        let privileged = self.privileged();

        use SyscallKind::*;
        let id_kind = match kind {
            Setuid | Setreuid | Setresuid | Setfsuid | Getresuid => IdKind::Uid,
            Setgid | Setregid | Setresgid | Setfsgid | Getresgid => IdKind::Gid,
            Getuid => return Some(Ok(self.uids.real as isize)),
            Geteuid => return Some(Ok(self.uids.effective as isize)),
            Getgid => return Some(Ok(self.gids.real as isize)),
            Getegid => return Some(Ok(self.gids.effective as isize)),
            _ => return None,
        };
        let ids = self.ids_mut(id_kind);
        let result = match kind {
            Setuid | Setgid => ids.set(a1, privileged).map(|()| 0),
            Setreuid | Setregid => ids.set_re(a1, a2, privileged).map(|()| 0),
            Setresuid | Setresgid => ids.set_res(a1, a2, a3, privileged).map(|()| 0),
            Setfsuid | Setfsgid => Ok(ids.set_fs(a1, privileged) as isize),
            Getresuid | Getresgid => {
                let ids = *ids;
                write_ids(tracee, &[ids.real, ids.effective, ids.saved]).map(|()| 0)
            }
            _ => return None,
        };
        Some(result)
    }

    /// Report the fake ids for files owned by the real user.
    fn fix_stat(&self, tracee: &mut Tracee, kind: SyscallKind) -> nix::Result<()> {
        use SyscallKind::*;
        let (buf_reg, uid_offset, gid_offset) = match (tracee.regs.arch(), kind) {
            (SupportedArch::X64, Stat) | (SupportedArch::X64, Lstat) | (SupportedArch::X64, Fstat) => (
                Reg::Sysarg2,
                offset_of!(libc::stat, st_uid),
                offset_of!(libc::stat, st_gid),
            ),
            (SupportedArch::X64, Newfstatat) => (
                Reg::Sysarg3,
                offset_of!(libc::stat, st_uid),
                offset_of!(libc::stat, st_gid),
            ),
            (SupportedArch::X86, Stat64) | (SupportedArch::X86, Lstat64) | (SupportedArch::X86, Fstat64) => {
                (Reg::Sysarg2, STAT64_UID_OFFSET, STAT64_GID_OFFSET)
            }
            (SupportedArch::X86, Fstatat64) => (Reg::Sysarg3, STAT64_UID_OFFSET, STAT64_GID_OFFSET),
            _ => return Ok(()),
        };
        let buf = tracee.regs.peek(RegVersion::Original, buf_reg);
        for &(offset, real, fake) in &[
            (uid_offset, getuid().as_raw(), self.uids.effective),
            (gid_offset, getgid().as_raw(), self.gids.effective),
        ] {
            let addr = RemotePtr::from(buf + offset);
            let mut id = [0u8; 4];
            tracee.read_data(addr, &mut id)?;
            if u32::from_ne_bytes(id) == real {
                tracee.write_data(addr, &fake.to_ne_bytes())?;
            }
        }
        Ok(())
    }

    /// `chroot("/")` of the guest is a no-op that only root may do.
    fn is_chroot_to_root(tracee: &Tracee) -> bool {
        match tracee.get_sysarg_path(Reg::Sysarg1) {
            Ok(Some(host)) => host == tracee.fs.borrow().bindings.root(),
            _ => false,
        }
    }
}

fn write_ids(tracee: &mut Tracee, ids: &[u32]) -> Result<(), i32> {
    let regs = [Reg::Sysarg1, Reg::Sysarg2, Reg::Sysarg3];
    for (&id, &reg) in ids.iter().zip(regs.iter()) {
        let addr = tracee.regs.peek(RegVersion::Current, reg);
        tracee
            .write_data(RemotePtr::from(addr), &id.to_ne_bytes())
            .map_err(|err| err as i32)?;
    }
    Ok(())
}

impl Extension for FakeId0 {
    fn name(&self) -> &'static str {
        "fake_id0"
    }

    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        use SyscallKind::*;
        [
            Getuid, Geteuid, Getgid, Getegid, Getresuid, Getresgid, Setuid, Setgid, Setreuid,
            Setregid, Setresuid, Setresgid, Setfsuid, Setfsgid, Chown, Chown32, Lchown, Lchown32,
            Fchown, Fchown32, Fchownat, Chroot, Mknod, Mknodat, Capset, Stat, Lstat, Fstat,
            Newfstatat, Stat64, Lstat64, Fstat64, Fstatat64,
        ]
        .iter()
        .map(|&kind| FilteredSysnum::new(kind, FILTER_SYSEXIT))
        .collect()
    }

    /// Any syscall that widened permissions has to come back through
    /// the exit stage to restore them.
    fn filter_flags(&self, kind: SyscallKind) -> Option<u32> {
        if !self.guards.is_empty() {
            return Some(FILTER_SYSEXIT);
        }
        is_filtered(&self.filtered_sysnums(), kind).map(|filtered| filtered.flags)
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64 {
        match event {
            // Credentials are per process.
            Event::InheritParent => 1,

            Event::SyscallEnterStart => {
                self.guards.clear();
                let kind = match tracee.sysnum(RegVersion::Current) {
                    Some(kind) => kind,
                    None => return 0,
                };
                match self.emulate_enter(tracee, kind) {
                    None => 0,
                    Some(Err(errno)) => -(errno as i64),
                    Some(Ok(result)) => {
                        tracee.void_syscall();
                        self.result = Some(result);
                        1
                    }
                }
            }

            Event::SyscallEnterEnd { status } if *status >= 0 => {
                if tracee.sysnum(RegVersion::Original) == Some(SyscallKind::Chroot)
                    && self.privileged()
                    && FakeId0::is_chroot_to_root(tracee)
                {
                    tracee.void_syscall();
                    self.result = Some(0);
                }
                0
            }

            Event::SyscallExitStart => match self.result.take() {
                Some(result) => {
                    tracee.regs.poke_signed(Reg::SysargResult, result);
                    1
                }
                None => 0,
            },

            Event::SyscallExitEnd => {
                self.guards.clear();
                use SyscallKind::*;
                let kind = match tracee.sysnum(RegVersion::Original) {
                    Some(kind) => kind,
                    None => return 0,
                };
                match kind {
                    Chown | Chown32 | Lchown | Lchown32 | Fchown | Fchown32 | Fchownat | Mknod
                    | Mknodat | Capset => {
                        if self.privileged()
                            && tracee.regs.syscall_result_signed() == -(EPERM as isize)
                        {
                            tracee.regs.poke(Reg::SysargResult, 0);
                        }
                    }
                    _ if !tracee.regs.syscall_failed() => {
                        if let Err(err) = self.fix_stat(tracee, kind) {
                            log!(LogDebug, "pid {}: can't fix stat ids: {}", tracee.pid, err);
                        }
                    }
                    _ => (),
                }
                0
            }

            Event::HostPath { path, is_final } if self.privileged() => {
                let is_dir = lstat(*path).map_or(false, |st| st.st_mode & S_IFMT == S_IFDIR);
                let wanted = if is_dir {
                    S_IRWXU
                } else if *is_final {
                    S_IRUSR | S_IWUSR
                } else {
                    return 0;
                };
                if let Some(guard) = PermissionGuard::widen(*path, wanted) {
                    self.guards.push(guard);
                }
                0
            }

            Event::Removed => {
                self.guards.clear();
                0
            }

            _ => 0,
        }
    }

    fn new_instance(&self) -> Option<ExtensionHandle> {
        Some(Rc::new(RefCell::new(FakeId0 {
            uids: self.uids,
            gids: self.gids,
            result: None,
            guards: Vec::new(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tracee::test_support::{fake_tracee, STACK_BASE},
        util::scratch_dir,
    };

    fn syscall(tracee: &mut Tracee, kind: SyscallKind, args: &[usize]) {
        tracee
            .regs
            .poke(Reg::SysargNum, kind.number(SupportedArch::X64).unwrap());
        for (i, &arg) in args.iter().enumerate() {
            tracee.regs.poke(Reg::sysarg(i + 1), arg);
        }
        tracee.regs.save_current(RegVersion::Original);
    }

    /// Run the enter and exit events the way the translator does, with the
    /// kernel answering `kernel_result`.
    fn run(ext: &mut FakeId0, tracee: &mut Tracee, kernel_result: isize) -> isize {
        let status = ext.event(tracee, &mut Event::SyscallEnterStart);
        if status < 0 {
            return status as isize;
        }
        ext.event(tracee, &mut Event::SyscallEnterEnd { status: 0 });
        tracee.regs.poke_signed(Reg::SysargResult, kernel_result);
        ext.event(tracee, &mut Event::SyscallExitStart);
        ext.event(tracee, &mut Event::SyscallExitEnd);
        tracee.regs.syscall_result_signed()
    }

    #[test]
    fn root_drops_privileges() {
        let mut ext = FakeId0::new(0, 0);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let enosys = -(libc::ENOSYS as isize);

        syscall(&mut tracee, SyscallKind::Getuid, &[]);
        assert_eq!(0, run(&mut ext, &mut tracee, enosys));
        assert_eq!(SyscallKind::VOID_SYSNUM, tracee.regs.peek_signed(RegVersion::Current, Reg::SysargNum));

        syscall(&mut tracee, SyscallKind::Setresuid, &[1000, 1000, UNCHANGED as usize]);
        assert_eq!(0, run(&mut ext, &mut tracee, enosys));
        assert_eq!(
            IdSet {
                real: 1000,
                effective: 1000,
                saved: 0,
                fs: 1000
            },
            ext.uids
        );

        // The saved id allows going back.
        syscall(&mut tracee, SyscallKind::Setuid, &[0]);
        assert_eq!(0, run(&mut ext, &mut tracee, enosys));
        assert_eq!(0, ext.uids.effective);
        assert_eq!(1000, ext.uids.real);

        syscall(&mut tracee, SyscallKind::Setuid, &[1000]);
        assert_eq!(0, run(&mut ext, &mut tracee, enosys));
        assert_eq!(IdSet::new(1000), ext.uids);

        syscall(&mut tracee, SyscallKind::Setuid, &[0]);
        assert_eq!(-(EPERM as isize), run(&mut ext, &mut tracee, enosys));
    }

    #[test]
    fn setreuid_rules() {
        let mut ids = IdSet::new(0);
        ids.set_re(UNCHANGED, 500, true).unwrap();
        assert_eq!(0, ids.saved);
        ids.set_re(500, 500, true).unwrap();
        assert_eq!(IdSet::new(500), ids);
        assert_eq!(Err(EPERM), ids.set_re(0, UNCHANGED, false));
        assert_eq!(500, ids.set_fs(0, false));
        assert_eq!(500, ids.fs);
    }

    #[test]
    fn getresuid_writes_all_three() {
        let mut ext = FakeId0::new(7, 8);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        syscall(&mut tracee, SyscallKind::Getresgid, &[STACK_BASE, STACK_BASE + 4, STACK_BASE + 8]);
        assert_eq!(0, run(&mut ext, &mut tracee, -(libc::ENOSYS as isize)));
        let mut raw = [0u8; 12];
        tracee.read_data(RemotePtr::from(STACK_BASE), &mut raw).unwrap();
        assert_eq!([8, 0, 0, 0, 8, 0, 0, 0, 8, 0, 0, 0], raw);
    }

    #[test]
    fn chown_eperm_is_success() {
        let mut ext = FakeId0::new(0, 0);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        syscall(&mut tracee, SyscallKind::Chown, &[STACK_BASE, 0, 0]);
        assert_eq!(0, run(&mut ext, &mut tracee, -(EPERM as isize)));
        syscall(&mut tracee, SyscallKind::Chown, &[STACK_BASE, 0, 0]);
        assert_eq!(
            -(libc::ENOENT as isize),
            run(&mut ext, &mut tracee, -(libc::ENOENT as isize))
        );
    }

    #[test]
    fn stat_reports_fake_owner() {
        let mut ext = FakeId0::new(0, 0);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_uid = getuid().as_raw();
        st.st_gid = getgid().as_raw().wrapping_add(1);
        tracee
            .write_data(RemotePtr::from(STACK_BASE), crate::util::u8_slice(&st))
            .unwrap();
        syscall(&mut tracee, SyscallKind::Stat, &[0, STACK_BASE]);
        assert_eq!(0, run(&mut ext, &mut tracee, 0));

        let mut back: libc::stat = unsafe { std::mem::zeroed() };
        tracee
            .read_data(RemotePtr::from(STACK_BASE), crate::util::u8_slice_mut(&mut back))
            .unwrap();
        assert_eq!(0, back.st_uid);
        assert_eq!(getgid().as_raw().wrapping_add(1), back.st_gid);
    }

    #[test]
    fn children_get_their_own_credentials() {
        let mut ext = FakeId0::new(0, 0);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        assert_eq!(1, ext.event(&mut tracee, &mut Event::InheritParent));
        let child = ext.new_instance().unwrap();
        ext.uids = IdSet::new(42);
        let mut child_tracee = fake_tracee(Path::new("/"), "/");
        syscall(&mut child_tracee, SyscallKind::Geteuid, &[]);
        let status = child.borrow_mut().event(&mut child_tracee, &mut Event::SyscallEnterStart);
        assert_eq!(1, status);
        child.borrow_mut().event(&mut child_tracee, &mut Event::SyscallExitStart);
        assert_eq!(0, child_tracee.regs.syscall_result_signed());
    }

    #[test]
    fn permissions_widened_for_one_syscall() {
        let dir = scratch_dir("fake-id0-perm");
        let file = dir.join("secret");
        fs::write(&file, b"").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o000)).unwrap();

        let mut ext = FakeId0::new(0, 0);
        let mut tracee = fake_tracee(Path::new("/"), "/");
        ext.event(
            &mut tracee,
            &mut Event::HostPath {
                path: &file,
                is_final: true,
            },
        );
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(0o600, mode);
        assert_eq!(Some(FILTER_SYSEXIT), ext.filter_flags(SyscallKind::Close));

        ext.event(&mut tracee, &mut Event::SyscallExitEnd);
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(0, mode);
        assert_eq!(None, ext.filter_flags(SyscallKind::Close));
        fs::remove_dir_all(&dir).unwrap();
    }
}
