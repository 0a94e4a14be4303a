//! The tracer side of vroot.
//!
//! The first tracee is forked from here; every process and thread it
//! creates afterwards is attached by the kernel (`PTRACE_O_TRACE{FORK,
//! VFORK,CLONE}`). All their stops come through a single
//! `waitpid(-1, __WALL)` loop and are dispatched to the syscall
//! translation, the fork bookkeeping or the signal policy.

use crate::{
    arch::Reg,
    extension::{extensions_want_sysexit, inherit_extensions, notify_extensions, Event, ExtensionHandle},
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    path::binding::Bindings,
    ptrace::{handle_ptracee_event, ptracee_gone, ptracer_gone, PtraceOptions},
    registers::RegVersion,
    remote_ptr::RemotePtr,
    seccomp_bpf::{core_filtered_sysnums, merge_filtered_sysnums, wants_sysexit, SeccompFilter},
    syscall::{skip_syscall_exit, sysnum::SyscallKind, translate_syscall},
    tracee::{
        fallible_ptrace,
        fs::{self, FileSystem, SharedFileSystem},
        SeccompState, SigStop, SyscallStage, Tracee, TraceeTable,
    },
    util::to_cstring,
    wait_status::{WaitStatus, WaitType},
};
use libc::{c_int, c_ulong, pid_t, SIGSTOP};
use nix::{
    errno::{errno, Errno},
    sched::CloneFlags,
    sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{chdir, execvp, fork, getpid, ForkResult, Pid},
};
use std::{
    ffi::{CStr, CString, OsString},
    path::{Path, PathBuf},
    rc::Rc,
    sync::atomic::{AtomicI32, Ordering},
};

/// `personality(2)` flag, not exported by every libc version.
const ADDR_NO_RANDOMIZE: c_ulong = 0x0040000;

/// Cap for an infinite stack limit: the kernel lays out the address space
/// of a process differently otherwise.
const MAX_STACK_LIMIT: libc::rlim_t = 256 * 1024 * 1024;

/// Last terminating signal vroot received, 0 if none.
static TERMINATING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_terminating_signal(sig: c_int) {
    TERMINATING_SIGNAL.store(sig, Ordering::Relaxed);
}

/// Options of every tracee. Children inherit them from the first one.
fn tracer_options() -> PtraceOptions {
    PtraceOptions::TRACESYSGOOD
        | PtraceOptions::TRACEFORK
        | PtraceOptions::TRACEVFORK
        | PtraceOptions::TRACECLONE
        | PtraceOptions::TRACEEXEC
        | PtraceOptions::TRACESECCOMP
        | PtraceOptions::EXITKILL
}

/// What the user asked to run, and how.
pub struct Launch<'a> {
    pub command: &'a [OsString],
    pub fs: SharedFileSystem,
    pub extensions: Vec<ExtensionHandle>,
    pub use_seccomp: bool,
}

pub struct EventLoop {
    tracees: TraceeTable,
    first_pid: pid_t,
    exit_code: i32,
    /// For processes that stop before their parent's fork event.
    bindings: Rc<Bindings>,
}

impl EventLoop {
    /// Fork the first tracee. It is stopped, and its command not executed
    /// yet, when this returns.
    pub fn launch(launch: Launch) -> nix::Result<EventLoop> {
        // Everything the child needs is allocated before the fork.
        let argv = launch
            .command
            .iter()
            .map(|arg| to_cstring(Path::new(arg)))
            .collect::<nix::Result<Vec<CString>>>()?;
        if argv.is_empty() {
            return Err(Errno::EINVAL);
        }
        let argv_refs: Vec<&CStr> = argv.iter().map(|arg| arg.as_c_str()).collect();
        let filter = if launch.use_seccomp {
            Some(build_seccomp_filter(&launch.extensions)?)
        } else {
            None
        };
        let (bindings, host_cwd) = {
            let fs = launch.fs.borrow();
            (Rc::clone(&fs.bindings), fs.bindings.guest_to_host(&fs.cwd))
        };

        let pid = loop {
            // fork() can fail with EAGAIN under load.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => run_initial_child(&argv_refs, &host_cwd, filter.as_ref()),
                Ok(ForkResult::Parent { child }) => break child.as_raw(),
                Err(Errno::EAGAIN) => continue,
                Err(err) => return Err(err),
            }
        };
        log!(LogInfo, "pid {}: started {:?}", pid, launch.command);

        let mut tracee = Tracee::new(pid, launch.fs);
        tracee.extensions = launch.extensions;
        // It stops itself before exec'ing.
        tracee.sigstop = SigStop::Ignored;
        if filter.is_some() {
            tracee.seccomp = SeccompState::Enabled;
        }
        notify_extensions(&mut tracee, &mut Event::Initialization);

        let mut tracees = TraceeTable::new();
        tracees.insert(pid, tracee);
        Ok(EventLoop {
            tracees,
            first_pid: pid,
            exit_code: 0,
            bindings,
        })
    }

    /// Serve the tracees until none is left. Returns the exit code of the
    /// first one.
    pub fn run(&mut self) -> i32 {
        install_signal_handlers();
        loop {
            let mut raw_status: i32 = 0;
            let pid = unsafe { libc::waitpid(-1, &mut raw_status, libc::__WALL) };
            if pid < 0 {
                match Errno::from_i32(errno()) {
                    Errno::EINTR => {
                        self.check_terminating_signal();
                        continue;
                    }
                    Errno::ECHILD => break,
                    err => fatal!("waitpid(-1) failed: {}", err),
                }
            }
            let status = WaitStatus::new(raw_status);
            log!(LogDebug, "waitpid(-1) returns {}; status {}", pid, status);
            self.handle_event(pid, status);
            self.check_terminating_signal();
        }
        self.exit_code
    }

    fn check_terminating_signal(&mut self) {
        let sig = TERMINATING_SIGNAL.swap(0, Ordering::Relaxed);
        if sig == 0 {
            return;
        }
        log!(LogWarn, "signal {} received, killing all tracees", sig);
        for &pid in self.tracees.keys() {
            kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap_or(());
        }
    }

    fn handle_event(&mut self, pid: pid_t, status: WaitStatus) {
        let mut tracee = match self.tracees.remove(&pid) {
            Some(tracee) => tracee,
            None => {
                if status.is_stopped() {
                    // Its parent's fork event hasn't been seen yet.
                    log!(LogDebug, "pid {}: stopped before being announced", pid);
                    let fs = FileSystem::new(PathBuf::from("/"), Rc::clone(&self.bindings));
                    let mut tracee = Tracee::new(pid, fs);
                    tracee.sigstop = SigStop::Pending;
                    self.tracees.insert(pid, tracee);
                }
                return;
            }
        };

        match status.wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                self.tracee_exited(tracee, status);
                return;
            }
            _ => (),
        }

        if !handle_ptracee_event(&mut tracee, &mut self.tracees, status) {
            if let Some(signal) = handle_stop(&mut tracee, &mut self.tracees, status) {
                restart_tracee(&mut tracee, signal);
            }
        }
        self.tracees.insert(pid, tracee);
    }

    fn tracee_exited(&mut self, mut tracee: Tracee, status: WaitStatus) {
        log!(LogInfo, "pid {}: exited, status {}", tracee.pid, status);
        if tracee.pid == self.first_pid {
            if let Some(code) = exit_code(status) {
                self.exit_code = code;
            }
        }
        ptracee_gone(&tracee, &mut self.tracees);
        ptracer_gone(tracee.pid, &mut self.tracees);
        notify_extensions(&mut tracee, &mut Event::Removed);
    }
}

/// `$?` of a process that ended with `status`.
fn exit_code(status: WaitStatus) -> Option<i32> {
    status
        .exit_code()
        .or_else(|| status.fatal_sig().map(|sig| 128 + sig))
}

/// The seccomp program trapping what vroot and `extensions` need to see.
fn build_seccomp_filter(extensions: &[ExtensionHandle]) -> nix::Result<SeccompFilter> {
    let mut lists = vec![core_filtered_sysnums()];
    lists.extend(extensions.iter().map(|e| e.borrow().filtered_sysnums()));
    let lists: Vec<&[_]> = lists.iter().map(|list| list.as_slice()).collect();
    SeccompFilter::build(&merge_filtered_sysnums(&lists))
}

fn install_signal_handlers() {
    // No SA_RESTART: waitpid() has to be interrupted.
    let terminate = SigAction::new(
        SigHandler::Handler(handle_terminating_signal),
        SaFlags::empty(),
        SigSet::all(),
    );
    for &sig in &[Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT] {
        if let Err(err) = unsafe { sigaction(sig, &terminate) } {
            log!(LogWarn, "sigaction({:?}) failed: {}", sig, err);
        }
    }
    // The terminal sends ^C to the tracees too; they decide.
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    if let Err(err) = unsafe { sigaction(Signal::SIGINT, &ignore) } {
        log!(LogWarn, "sigaction(SIGINT) failed: {}", err);
    }
}

/// The child side of the fork. Never returns.
fn run_initial_child(argv: &[&CStr], host_cwd: &Path, filter: Option<&SeccompFilter>) -> ! {
    if let Err(err) = fallible_ptrace(libc::PTRACE_TRACEME, 0, 0, 0) {
        spawned_child_fatal_error(&format!("ptrace(TRACEME) failed: {}", err));
    }

    let persona = unsafe { libc::personality(0xffff_ffff) };
    if persona < 0 || unsafe { libc::personality(persona as c_ulong | ADDR_NO_RANDOMIZE) } < 0 {
        log!(LogWarn, "can't disable ASLR");
    }
    cap_stack_limit();

    if let Err(err) = chdir(host_cwd) {
        log!(LogWarn, "chdir({:?}) failed: {}", host_cwd, err);
    }

    // Tell the tracer we're ready; it sets its ptrace options meanwhile.
    kill(getpid(), Signal::SIGSTOP).unwrap_or(());

    if let Some(filter) = filter {
        if let Err(err) = filter.install() {
            spawned_child_fatal_error(&format!(
                "can't install the seccomp filter ({}), try --no-seccomp",
                err
            ));
        }
    }

    let err = match execvp(argv[0], argv) {
        Err(err) => err,
        Ok(never) => match never {},
    };
    spawned_child_fatal_error(&format!("execvp {:?} failed: {}", argv[0], err));
}

fn spawned_child_fatal_error(msg: &str) -> ! {
    eprintln!("vroot: {}", msg);
    unsafe { libc::_exit(1) }
}

fn cap_stack_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let mut ret = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };
    if ret == 0 && limit.rlim_max == libc::RLIM_INFINITY {
        limit.rlim_max = MAX_STACK_LIMIT;
        limit.rlim_cur = limit.rlim_cur.min(MAX_STACK_LIMIT);
        ret = unsafe { libc::setrlimit(libc::RLIMIT_STACK, &limit) };
    }
    if ret != 0 {
        log!(LogWarn, "can't set the maximum stack size");
    }
}

/// Resume `tracee` unless it's blocked in an emulated wait(2).
fn restart_tracee(tracee: &mut Tracee, signal: i32) {
    if tracee.as_ptracer.wait_pid != 0 {
        return;
    }
    if let Err(err) = tracee.restart(signal) {
        // ESRCH: it died meanwhile, its exit status is on its way.
        if err != Errno::ESRCH {
            log!(LogWarn, "pid {}: can't restart: {}", tracee.pid, err);
        }
    }
}

/// The ptracer of `ptracee` restarted it with `signal`: handle the stop it
/// was held in, then let it go.
pub fn resume_ptracee(ptracee: &mut Tracee, others: &mut TraceeTable, signal: i32) {
    ptracee.as_ptracee.stopped_for_ptracer = false;
    let status = match ptracee.as_ptracee.vroot_event.take() {
        Some(status) => status,
        None => {
            restart_tracee(ptracee, signal);
            return;
        }
    };
    let own_signal = match handle_stop(ptracee, others, status) {
        Some(own_signal) => own_signal,
        None => return,
    };
    // The ptracer decides what becomes of a signal.
    let signal = if status.stop_sig().is_some() {
        signal
    } else {
        own_signal
    };
    restart_tracee(ptracee, signal);
}

/// Handle a stop of `tracee`. Returns the signal to restart it with, or
/// `None` when it has to stay stopped.
fn handle_stop(tracee: &mut Tracee, others: &mut TraceeTable, status: WaitStatus) -> Option<i32> {
    if notify_extensions(tracee, &mut Event::NewStatus { status }) != 0 {
        return None;
    }

    if !tracee.options_set {
        match set_ptrace_options(tracee) {
            Ok(()) => (),
            // Killed meanwhile: its exit status removes it from the table.
            Err(Errno::ESRCH) => {
                log!(LogDebug, "pid {}: gone before PTRACE_SETOPTIONS", tracee.pid);
                return None;
            }
            Err(err) => fatal!("pid {}: PTRACE_SETOPTIONS failed: {}", tracee.pid, err),
        }
    }

    match status.wait_type() {
        WaitType::SyscallStop => {
            if let Err(err) = translate_syscall(tracee, others) {
                log!(LogDebug, "pid {}: lost in a syscall: {}", tracee.pid, err);
                return None;
            }
            Some(0)
        }
        WaitType::PtraceEvent => {
            match status.ptrace_event() {
                Some(libc::PTRACE_EVENT_FORK)
                | Some(libc::PTRACE_EVENT_VFORK)
                | Some(libc::PTRACE_EVENT_CLONE) => handle_new_child(tracee, others),
                Some(libc::PTRACE_EVENT_SECCOMP) => handle_seccomp_event(tracee, others),
                _ => (),
            }
            Some(0)
        }
        WaitType::SignalStop | WaitType::GroupStop => {
            signal_stop(tracee, status.stop_sig().unwrap_or(SIGSTOP))
        }
        WaitType::Exit | WaitType::FatalSignal => None,
    }
}

fn set_ptrace_options(tracee: &mut Tracee) -> nix::Result<()> {
    let options = tracer_options();
    let mut result = fallible_ptrace(libc::PTRACE_SETOPTIONS, tracee.pid, 0, options.bits() as usize);
    if result == Err(Errno::EINVAL) {
        // PTRACE_O_EXITKILL is only known since Linux 3.8.
        let options = options - PtraceOptions::EXITKILL;
        result = fallible_ptrace(libc::PTRACE_SETOPTIONS, tracee.pid, 0, options.bits() as usize);
    }
    result?;
    tracee.options_set = true;
    Ok(())
}

/// Signal-delivery stop: the signal is delivered unless it's the SIGSTOP we
/// expect from a new tracee.
fn signal_stop(tracee: &mut Tracee, sig: i32) -> Option<i32> {
    if sig != SIGSTOP {
        return Some(sig);
    }
    match tracee.sigstop {
        SigStop::Ignored => {
            tracee.sigstop = SigStop::Allowed;
            Some(0)
        }
        // Resumed by its parent's fork event.
        SigStop::Pending => None,
        SigStop::Allowed => Some(sig),
    }
}

fn get_event_msg(tracee: &Tracee) -> nix::Result<c_ulong> {
    let mut msg: c_ulong = 0;
    fallible_ptrace(
        libc::PTRACE_GETEVENTMSG,
        tracee.pid,
        0,
        &mut msg as *mut c_ulong as usize,
    )?;
    Ok(msg)
}

/// Flags of the fork-like syscall `tracee` is in.
fn clone_flags(tracee: &Tracee) -> CloneFlags {
    let arg1 = tracee.regs.peek(RegVersion::Current, Reg::Sysarg1);
    let raw = match tracee.sysnum(RegVersion::Current) {
        Some(SyscallKind::Clone) => arg1 as u64,
        Some(SyscallKind::Clone3) => {
            // `struct clone_args` starts with the flags.
            let mut buf = [0u8; 8];
            match tracee.read_data(RemotePtr::from(arg1), &mut buf) {
                Ok(()) => u64::from_ne_bytes(buf),
                Err(_) => 0,
            }
        }
        _ => 0,
    };
    CloneFlags::from_bits_truncate(raw as c_int)
}

/// PTRACE_EVENT_{FORK,VFORK,CLONE}: the new process or thread inherits the
/// configuration of `tracee`.
fn handle_new_child(tracee: &mut Tracee, others: &mut TraceeTable) {
    let child_pid = match get_event_msg(tracee) {
        Ok(msg) => msg as pid_t,
        Err(err) => {
            log!(LogWarn, "pid {}: PTRACE_GETEVENTMSG failed: {}", tracee.pid, err);
            return;
        }
    };
    if let Err(err) = tracee.fetch_regs() {
        log!(LogWarn, "pid {}: can't read registers: {}", tracee.pid, err);
        return;
    }
    let flags = clone_flags(tracee);
    let fs = fs::inherit(&tracee.fs, flags.contains(CloneFlags::CLONE_FS));

    let mut child = match others.remove(&child_pid) {
        Some(mut early) => {
            early.fs = fs;
            early
        }
        None => {
            let mut child = Tracee::new(child_pid, fs);
            child.sigstop = SigStop::Ignored;
            child
        }
    };
    child.parent = if flags.intersects(CloneFlags::CLONE_PARENT | CloneFlags::CLONE_THREAD) {
        tracee.parent
    } else {
        Some(tracee.pid)
    };
    child.exe = tracee.exe.clone();
    child.seccomp = tracee.seccomp;
    child.options_set = true;
    inherit_extensions(tracee, &mut child);
    log!(
        LogDebug,
        "pid {}: new child {} ({:?})",
        tracee.pid,
        child_pid,
        flags
    );

    if child.sigstop == SigStop::Pending {
        child.sigstop = SigStop::Allowed;
        restart_tracee(&mut child, 0);
    }
    others.insert(child_pid, child);
}

/// PTRACE_EVENT_SECCOMP: the entry of a filtered syscall. Its exit is only
/// seen when someone asked for it.
fn handle_seccomp_event(tracee: &mut Tracee, others: &mut TraceeTable) {
    // Already seen through a syscall-stop.
    if tracee.seccomp == SeccompState::Disabled || tracee.stage == SyscallStage::Exit {
        return;
    }
    let msg = match get_event_msg(tracee) {
        Ok(msg) => msg,
        Err(err) => {
            log!(LogWarn, "pid {}: PTRACE_GETEVENTMSG failed: {}", tracee.pid, err);
            return;
        }
    };
    if let Err(err) = translate_syscall(tracee, others) {
        log!(LogDebug, "pid {}: lost in a syscall: {}", tracee.pid, err);
        return;
    }
    if !needs_syscall_exit(tracee, msg as usize) {
        skip_syscall_exit(tracee);
        if let Err(err) = tracee.push_regs() {
            log!(LogDebug, "pid {}: can't write registers: {}", tracee.pid, err);
        }
    }
}

/// Whether the exit stage of a syscall trapped by seccomp with `msg` as
/// its filter data has to be seen anyway.
fn needs_syscall_exit(tracee: &Tracee, msg: usize) -> bool {
    wants_sysexit(msg)
        || tracee.status < 0
        || !tracee.chain.queue.is_empty()
        || tracee
            .sysnum(RegVersion::Original)
            .map_or(false, |kind| extensions_want_sysexit(tracee, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::SupportedArch,
        extension::{Extension, FilteredSysnum, FILTER_SYSEXIT},
        tracee::test_support::{fake_tracee, STACK_BASE},
    };
    use std::cell::RefCell;

    #[test]
    fn exit_codes() {
        assert_eq!(Some(3), exit_code(WaitStatus::for_exit_code(3)));
        assert_eq!(Some(128 + 9), exit_code(WaitStatus::for_fatal_sig(9)));
        assert_eq!(None, exit_code(WaitStatus::for_stop_sig(SIGSTOP)));
    }

    #[test]
    fn first_sigstop_is_swallowed() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.sigstop = SigStop::Ignored;
        assert_eq!(Some(0), signal_stop(&mut tracee, SIGSTOP));
        assert_eq!(Some(SIGSTOP), signal_stop(&mut tracee, SIGSTOP));
        assert_eq!(Some(libc::SIGUSR1), signal_stop(&mut tracee, libc::SIGUSR1));

        tracee.sigstop = SigStop::Pending;
        assert_eq!(None, signal_stop(&mut tracee, SIGSTOP));
    }

    #[test]
    fn clone_fs_from_syscall_arguments() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let set = |tracee: &mut Tracee, kind: SyscallKind, arg1: usize| {
            tracee
                .regs
                .poke(Reg::SysargNum, kind.number(SupportedArch::X64).unwrap());
            tracee.regs.poke(Reg::Sysarg1, arg1);
        };

        set(&mut tracee, SyscallKind::Clone, (libc::CLONE_FS | libc::CLONE_VM) as usize);
        assert!(clone_flags(&tracee).contains(CloneFlags::CLONE_FS));

        set(&mut tracee, SyscallKind::Fork, libc::CLONE_FS as usize);
        assert!(clone_flags(&tracee).is_empty());

        let flags = (libc::CLONE_FS | libc::CLONE_THREAD) as u64;
        tracee
            .write_data(RemotePtr::from(STACK_BASE), &flags.to_ne_bytes())
            .unwrap();
        set(&mut tracee, SyscallKind::Clone3, STACK_BASE);
        assert!(clone_flags(&tracee).contains(CloneFlags::CLONE_FS | CloneFlags::CLONE_THREAD));
    }

    struct Freezer;

    impl Extension for Freezer {
        fn name(&self) -> &'static str {
            "freezer"
        }

        fn event(&mut self, _tracee: &mut Tracee, event: &mut Event) -> i64 {
            match event {
                Event::NewStatus { .. } => 1,
                _ => 0,
            }
        }
    }

    #[test]
    fn extension_keeps_tracee_stopped() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.extensions.push(Rc::new(RefCell::new(Freezer)));
        let status = WaitStatus::for_syscall(true);
        assert_eq!(None, handle_stop(&mut tracee, &mut TraceeTable::new(), status));
        assert_eq!(SyscallStage::NotInSyscall, tracee.stage);
    }

    #[test]
    fn vanished_tracee_is_left_to_its_exit_status() {
        // Not a child of the test process: ptrace answers ESRCH.
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let status = WaitStatus::for_syscall(true);
        assert_eq!(None, handle_stop(&mut tracee, &mut TraceeTable::new(), status));
        assert!(!tracee.options_set);
        assert_eq!(SyscallStage::NotInSyscall, tracee.stage);
    }

    struct ExitWatcher;

    impl Extension for ExitWatcher {
        fn name(&self) -> &'static str {
            "exit-watcher"
        }

        fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
            vec![FilteredSysnum::new(SyscallKind::Open, FILTER_SYSEXIT)]
        }

        fn event(&mut self, _tracee: &mut Tracee, _event: &mut Event) -> i64 {
            0
        }
    }

    #[test]
    fn seccomp_exit_kept_for_extensions() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let enter = |tracee: &mut Tracee, kind: SyscallKind| {
            tracee
                .regs
                .poke(Reg::SysargNum, kind.number(SupportedArch::X64).unwrap());
            tracee.regs.save_current(RegVersion::Original);
        };

        enter(&mut tracee, SyscallKind::Open);
        assert!(!needs_syscall_exit(&tracee, 0));
        assert!(needs_syscall_exit(&tracee, FILTER_SYSEXIT as usize));

        tracee.extensions.push(Rc::new(RefCell::new(ExitWatcher)));
        assert!(needs_syscall_exit(&tracee, 0));
        enter(&mut tracee, SyscallKind::Close);
        assert!(!needs_syscall_exit(&tracee, 0));

        tracee.status = -(libc::EPERM as isize);
        assert!(needs_syscall_exit(&tracee, 0));
    }

    #[test]
    fn filter_traps_core_syscalls() {
        let filter = build_seccomp_filter(&[]).unwrap();
        let execve = SyscallKind::Execve.number(SupportedArch::X64).unwrap() as u32;
        assert!(filter.filters.iter().any(|f| f.k == execve));
    }
}
