use crate::{
    arch::Reg,
    extension::ExtensionHandle,
    kernel_metadata::{ptrace_req_name, syscall_name},
    log::LogLevel::LogDebug,
    ptrace::{PtraceeState, PtracerState},
    registers::{RegVersion, Registers},
    remote_ptr::{RemotePtr, Void},
    syscall::sysnum::SyscallKind,
    tracee::{
        fs::SharedFileSystem,
        memory::{read_data, read_string, write_data, MemoryBackend, PtraceMemory},
    },
};
use libc::{pid_t, user_regs_struct};
use nix::errno::Errno;
use std::{
    collections::{HashMap, VecDeque},
    ffi::OsStr,
    mem,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

pub mod fs;
pub mod memory;

/// Every traced thread, by pid. Owned by the event loop.
pub type TraceeTable = HashMap<pid_t, Tracee>;

/// The x86_64 ABI lets leaf functions use 128 bytes below the stack
/// pointer, so injected data must go below that.
const RED_ZONE_SIZE: usize = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallStage {
    /// Not in a syscall: the next syscall-stop is an entry.
    NotInSyscall,
    /// The entry is being translated.
    Enter,
    /// The entry was handled: the next syscall-stop is the exit.
    Exit,
}

/// What to do with a SIGSTOP that reaches a tracee.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SigStop {
    /// Deliver it.
    Allowed,
    /// Swallow it once (we sent it ourselves).
    Ignored,
    /// The tracee stopped before its parent's fork event told us about it;
    /// it is restarted once that event shows up.
    Pending,
}

/// How the tracee is resumed after a stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartHow {
    /// Stop at every syscall entry and exit.
    Syscall,
    /// Run until the next seccomp trap or signal.
    Cont,
    /// One instruction, on behalf of an emulated ptracer.
    SingleStep,
}

impl RestartHow {
    pub fn request(self) -> u32 {
        match self {
            RestartHow::Syscall => libc::PTRACE_SYSCALL,
            RestartHow::Cont => libc::PTRACE_CONT,
            RestartHow::SingleStep => libc::PTRACE_SINGLESTEP,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeccompState {
    Disabled,
    Enabled,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChainedSyscall {
    pub sysnum: usize,
    pub args: [usize; 6],
}

/// Extra syscalls run by the tracee after the current one, before it gets
/// back to its own code.
#[derive(Clone, Debug, Default)]
pub struct SyscallChain {
    pub queue: VecDeque<ChainedSyscall>,
    /// Result reported for the whole chain instead of the last syscall's.
    pub final_result: Option<isize>,
    pub in_progress: bool,
}

pub struct Tracee {
    pub pid: pid_t,
    /// The tracee that created this one, if it's still known.
    pub parent: Option<pid_t>,
    pub regs: Registers,
    pub mem: Box<dyn MemoryBackend>,
    pub stage: SyscallStage,
    /// At syscall entry: `-errno` if the translation failed, otherwise the
    /// number of bytes allocated on the tracee stack.
    pub status: isize,
    pub fs: SharedFileSystem,
    pub extensions: Vec<ExtensionHandle>,
    pub chain: SyscallChain,
    pub as_ptracer: PtracerState,
    pub as_ptracee: PtraceeState,
    pub sigstop: SigStop,
    /// Guest path of the running program, for `/proc/<pid>/exe`.
    pub exe: Option<PathBuf>,
    /// Program being `execve`d, promoted to `exe` when the exec succeeds.
    pub new_exe: Option<PathBuf>,
    /// Guest path read by a pending `readlink`, for /proc magic links.
    pub readlink_referrer: Option<PathBuf>,
    /// Forced mode of the next restart, `Syscall` meaning "as usual".
    pub restart_how: RestartHow,
    pub seccomp: SeccompState,
    /// `*addrlen` of an `accept`-like syscall, as given by the tracee.
    pub saved_addrlen: usize,
    /// PTRACE_SETOPTIONS was done on this tracee.
    pub options_set: bool,
}

impl Tracee {
    pub fn new(pid: pid_t, fs: SharedFileSystem) -> Tracee {
        Tracee::with_memory(pid, fs, Box::new(PtraceMemory::new(pid)))
    }

    pub fn with_memory(pid: pid_t, fs: SharedFileSystem, mem: Box<dyn MemoryBackend>) -> Tracee {
        Tracee {
            pid,
            parent: None,
            regs: Registers::default(),
            mem,
            stage: SyscallStage::NotInSyscall,
            status: 0,
            fs,
            extensions: Vec::new(),
            chain: SyscallChain::default(),
            as_ptracer: PtracerState::default(),
            as_ptracee: PtraceeState::default(),
            sigstop: SigStop::Allowed,
            exe: None,
            new_exe: None,
            readlink_referrer: None,
            restart_how: RestartHow::Syscall,
            seccomp: SeccompState::Disabled,
            saved_addrlen: 0,
            options_set: false,
        }
    }

    /// Name of the syscall the tracee entered, for diagnostics.
    pub fn syscall_name(&self) -> String {
        syscall_name(
            self.regs.peek(RegVersion::Original, Reg::SysargNum),
            self.regs.arch(),
        )
    }

    pub fn sysnum(&self, version: RegVersion) -> Option<SyscallKind> {
        SyscallKind::decode(self.regs.peek(version, Reg::SysargNum), self.regs.arch())
    }

    pub fn set_sysnum(&mut self, kind: SyscallKind) {
        match kind.number(self.regs.arch()) {
            Some(nr) => self.regs.poke(Reg::SysargNum, nr as usize),
            None => self.void_syscall(),
        }
    }

    /// Turn the current syscall into one the kernel rejects without side
    /// effects. The result is set at the exit stage.
    pub fn void_syscall(&mut self) {
        self.regs.poke_signed(Reg::SysargNum, SyscallKind::VOID_SYSNUM);
    }

    pub fn peek_reg(&self, version: RegVersion, reg: Reg) -> usize {
        self.regs.peek(version, reg)
    }

    pub fn poke_reg(&mut self, reg: Reg, value: usize) {
        self.regs.poke(reg, value)
    }

    pub fn word_size(&self) -> usize {
        self.regs.layout().word_size()
    }

    pub fn fetch_regs(&mut self) -> nix::Result<()> {
        let mut regs: user_regs_struct = unsafe { mem::zeroed() };
        fallible_ptrace(
            libc::PTRACE_GETREGS,
            self.pid,
            0,
            &mut regs as *mut user_regs_struct as usize,
        )?;
        self.regs.set_from_ptrace(&regs);
        Ok(())
    }

    /// Push CURRENT back to the kernel, only if something changed.
    pub fn push_regs(&mut self) -> nix::Result<()> {
        if !self.regs.is_dirty() {
            return Ok(());
        }
        let regs = *self.regs.get_ptrace();
        fallible_ptrace(
            libc::PTRACE_SETREGS,
            self.pid,
            0,
            &regs as *const user_regs_struct as usize,
        )?;
        self.regs.clear_dirty();
        Ok(())
    }

    /// Move the stack pointer down by `size` bytes (up if negative) and
    /// return its new value.
    pub fn resize_stack(&mut self, size: isize) -> nix::Result<RemotePtr<Void>> {
        let sp = self.regs.sp();
        let new_sp = if size >= 0 {
            sp.checked_sub(size as usize)
        } else {
            sp.checked_add(size.unsigned_abs())
                .filter(|&v| v <= self.regs.layout().max_address())
        }
        .ok_or(Errno::EFAULT)?;
        self.regs.poke(Reg::StackPointer, new_sp);
        Ok(RemotePtr::from(new_sp))
    }

    /// Reserve `size` bytes on the tracee stack, below the red zone on the
    /// first allocation of a syscall. Accounted in `status`.
    pub fn alloc_mem(&mut self, size: usize) -> nix::Result<RemotePtr<Void>> {
        let mut total = size;
        let original_sp = self.regs.peek(RegVersion::Original, Reg::StackPointer);
        if self.regs.sp() == original_sp && self.word_size() == 8 {
            total += RED_ZONE_SIZE;
        }
        let ptr = self.resize_stack(total as isize)?;
        log!(LogDebug, "pid {}: {} bytes reserved at {}", self.pid, total, ptr);
        if self.status >= 0 {
            self.status += total as isize;
        }
        Ok(ptr)
    }

    pub fn read_data(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> nix::Result<()> {
        read_data(self.mem.as_ref(), addr, buf)
    }

    pub fn write_data(&mut self, addr: RemotePtr<Void>, data: &[u8]) -> nix::Result<()> {
        write_data(self.mem.as_mut(), addr, data)
    }

    /// Read a C string of at most `max` bytes, terminator excluded from
    /// the result. ENAMETOOLONG if there's no terminator in range.
    pub fn read_c_string(&self, addr: RemotePtr<Void>, max: usize) -> nix::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = read_string(self.mem.as_ref(), addr, &mut buf)?;
        if buf[n - 1] != 0 {
            return Err(Errno::ENAMETOOLONG);
        }
        buf.truncate(n - 1);
        Ok(buf)
    }

    /// Pointer-sized read: 4 bytes for a compat tracee.
    pub fn peek_mem(&self, addr: RemotePtr<Void>) -> nix::Result<usize> {
        let mut buf = [0u8; 8];
        let size = self.word_size();
        self.read_data(addr, &mut buf[..size])?;
        Ok(if size == 4 {
            u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
        } else {
            usize::from_ne_bytes(buf)
        })
    }

    pub fn poke_mem(&mut self, addr: RemotePtr<Void>, value: usize) -> nix::Result<()> {
        let size = self.word_size();
        let bytes = value.to_ne_bytes();
        self.write_data(addr, &bytes[..size])
    }

    /// The path pointed to by `reg`, `None` for a NULL pointer.
    pub fn get_sysarg_path(&self, reg: Reg) -> nix::Result<Option<PathBuf>> {
        let addr = self.regs.peek(RegVersion::Current, reg);
        if addr == 0 {
            return Ok(None);
        }
        let bytes = self.read_c_string(RemotePtr::from(addr), libc::PATH_MAX as usize)?;
        Ok(Some(PathBuf::from(OsStr::from_bytes(&bytes))))
    }

    /// Copy `data` on the tracee stack and make `reg` point to it. The
    /// stack is left untouched on failure.
    pub fn set_sysarg_data(&mut self, reg: Reg, data: &[u8]) -> nix::Result<RemotePtr<Void>> {
        let saved_sp = self.regs.sp();
        let saved_status = self.status;
        let result = self.alloc_mem(data.len()).and_then(|ptr| {
            self.write_data(ptr, data)?;
            Ok(ptr)
        });
        match result {
            Ok(ptr) => {
                self.regs.poke(reg, ptr.as_usize());
                Ok(ptr)
            }
            Err(err) => {
                self.regs.poke(Reg::StackPointer, saved_sp);
                self.status = saved_status;
                Err(err)
            }
        }
    }

    pub fn set_sysarg_path(&mut self, reg: Reg, path: &Path) -> nix::Result<()> {
        let mut data = path.as_os_str().as_bytes().to_vec();
        data.push(0);
        self.set_sysarg_data(reg, &data).map(drop)
    }

    /// Queue a syscall to run right after the current one.
    pub fn register_chained_syscall(&mut self, sysnum: SyscallKind, args: [usize; 6]) -> nix::Result<()> {
        let sysnum = sysnum.number(self.regs.arch()).ok_or(Errno::ENOSYS)?;
        self.chain.queue.push_back(ChainedSyscall {
            sysnum: sysnum as usize,
            args,
        });
        Ok(())
    }

    pub fn force_chain_final_result(&mut self, result: isize) {
        self.chain.final_result = Some(result);
    }

    /// How the next restart resumes the tracee. Under seccomp, only the
    /// stops the filter asks for are needed outside of a syscall.
    pub fn next_restart(&self) -> RestartHow {
        if self.restart_how == RestartHow::SingleStep {
            RestartHow::SingleStep
        } else if self.seccomp == SeccompState::Enabled
            && self.stage == SyscallStage::NotInSyscall
            && !self.chain.in_progress
            && self.chain.queue.is_empty()
            && self.as_ptracee.ptracer.is_none()
        {
            RestartHow::Cont
        } else {
            RestartHow::Syscall
        }
    }

    /// Resume the tracee, delivering `signal` (0 for none).
    pub fn restart(&mut self, signal: i32) -> nix::Result<()> {
        let how = self.next_restart();
        self.restart_how = RestartHow::Syscall;
        fallible_ptrace(how.request(), self.pid, 0, signal as usize).map(drop)
    }
}

/// Make a raw ptrace request on `pid`. Failures come back as `Errno`.
pub fn fallible_ptrace(request: u32, pid: pid_t, addr: usize, data: usize) -> nix::Result<isize> {
    unsafe { *libc::__errno_location() = 0 };
    let ret = unsafe {
        libc::ptrace(
            request,
            pid,
            addr as *mut libc::c_void,
            data as *mut libc::c_void,
        )
    };
    if ret == -1 && nix::errno::errno() != 0 {
        let err = Errno::last();
        if err != Errno::ESRCH {
            log!(
                LogDebug,
                "{}({}) failed: {}",
                ptrace_req_name(request),
                pid,
                err
            );
        }
        return Err(err);
    }
    Ok(ret as isize)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::{path::binding::Bindings, tracee::fs::FileSystem, tracee::memory::LocalMemory};
    use std::rc::Rc;

    pub const STACK_BASE: usize = 0x7000_0000;
    pub const STACK_SIZE: usize = 0x4000;

    /// A 64-bit tracee with a local stack, its stack pointer at the top
    /// minus a page.
    pub fn fake_tracee(root: &Path, cwd: &str) -> Tracee {
        let bindings = Rc::new(Bindings::new(root.to_path_buf(), vec![]));
        let fs = FileSystem::new(PathBuf::from(cwd), bindings);
        let mem = LocalMemory::new(STACK_BASE, STACK_SIZE);
        let mut tracee = Tracee::with_memory(4242, fs, Box::new(mem));
        let mut raw: user_regs_struct = unsafe { mem::zeroed() };
        raw.cs = 0x33;
        raw.rsp = (STACK_BASE + STACK_SIZE - 0x1000) as u64;
        tracee.regs.set_from_ptrace(&raw);
        tracee.regs.save_current(RegVersion::Original);
        tracee
    }

    /// Store a C string at `offset` from the bottom of the fake stack.
    pub fn put_string(tracee: &mut Tracee, offset: usize, s: &str) -> usize {
        let addr = STACK_BASE + offset;
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        tracee.write_data(RemotePtr::from(addr), &data).unwrap();
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    #[test]
    fn sysarg_path_round_trip_and_red_zone() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let sp = tracee.regs.sp();
        tracee.set_sysarg_path(Reg::Sysarg1, Path::new("/etc/hosts")).unwrap();
        assert_eq!(sp - 11 - RED_ZONE_SIZE, tracee.regs.sp());
        assert_eq!(11 + RED_ZONE_SIZE as isize, tracee.status);
        assert_eq!(
            Some(PathBuf::from("/etc/hosts")),
            tracee.get_sysarg_path(Reg::Sysarg1).unwrap()
        );

        // Second allocation of the same syscall: no extra red zone.
        tracee.set_sysarg_path(Reg::Sysarg2, Path::new("/x")).unwrap();
        assert_eq!(sp - 11 - 3 - RED_ZONE_SIZE, tracee.regs.sp());
    }

    #[test]
    fn null_path_argument() {
        let tracee = fake_tracee(Path::new("/"), "/");
        assert_eq!(None, tracee.get_sysarg_path(Reg::Sysarg3).unwrap());
    }

    #[test]
    fn failed_copy_rolls_back_stack() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let sp = tracee.regs.sp();
        let too_big = vec![1u8; STACK_SIZE];
        assert_eq!(Err(Errno::EFAULT), tracee.set_sysarg_data(Reg::Sysarg1, &too_big).map(drop));
        assert_eq!(sp, tracee.regs.sp());
        assert_eq!(0, tracee.status);
    }

    #[test]
    fn resize_stack_overflow() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.regs.poke(Reg::StackPointer, 16);
        assert_eq!(Err(Errno::EFAULT), tracee.resize_stack(32).map(drop));
        tracee.regs.poke(Reg::StackPointer, usize::MAX - 4);
        assert_eq!(Err(Errno::EFAULT), tracee.resize_stack(-8).map(drop));
    }

    #[test]
    fn pointer_sized_access() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let addr = RemotePtr::from(STACK_BASE + 0x10);
        tracee.poke_mem(addr, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(0x1122_3344_5566_7788, tracee.peek_mem(addr).unwrap());
    }

    #[test]
    fn restart_mode() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        assert_eq!(RestartHow::Syscall, tracee.next_restart());
        tracee.seccomp = SeccompState::Enabled;
        assert_eq!(RestartHow::Cont, tracee.next_restart());
        tracee.stage = SyscallStage::Exit;
        assert_eq!(RestartHow::Syscall, tracee.next_restart());
        tracee.stage = SyscallStage::NotInSyscall;
        tracee.as_ptracee.ptracer = Some(1);
        assert_eq!(RestartHow::Syscall, tracee.next_restart());
        tracee.restart_how = RestartHow::SingleStep;
        assert_eq!(RestartHow::SingleStep, tracee.next_restart());
    }

    #[test]
    fn unterminated_string_is_too_long() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let addr = STACK_BASE;
        tracee.write_data(RemotePtr::from(addr), &[b'a'; 64]).unwrap();
        assert_eq!(
            Err(Errno::ENAMETOOLONG),
            tracee.read_c_string(RemotePtr::from(addr), 32)
        );
    }
}
