//! Emulated ptrace(2).
//!
//! A process can only have one tracer, and every tracee already has us. A
//! tracee that uses ptrace itself (a debugger, strace...) is given an
//! emulation instead: its requests are voided at syscall entry and
//! performed at syscall exit through our own link to the ptracee, and the
//! events of its ptracees are held back until it waits for them (see
//! [`wait`]).
//!
//! A ptracee stop is reported to the ptracer before we handle it
//! ourselves; our own handling happens when the ptracer restarts it.

use crate::{
    arch::{Reg, SupportedArch},
    event_loop::resume_ptracee,
    log::LogLevel::{LogDebug, LogWarn},
    kernel_metadata::ptrace_req_name,
    registers::RegVersion,
    remote_ptr::RemotePtr,
    tracee::{fallible_ptrace, RestartHow, SeccompState, SigStop, Tracee, TraceeTable},
    util::{u8_slice, u8_slice_mut},
    wait_status::WaitStatus,
};
use libc::{pid_t, siginfo_t, user_regs_struct, SIGSTOP};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    mem,
    sync::atomic::{AtomicBool, Ordering},
};

pub mod wait;

static WARNED_PTRACE_USE: AtomicBool = AtomicBool::new(false);

bitflags! {
    #[derive(Default)]
    pub struct PtraceOptions: u32 {
        const TRACESYSGOOD = libc::PTRACE_O_TRACESYSGOOD as u32;
        const TRACEFORK = libc::PTRACE_O_TRACEFORK as u32;
        const TRACEVFORK = libc::PTRACE_O_TRACEVFORK as u32;
        const TRACECLONE = libc::PTRACE_O_TRACECLONE as u32;
        const TRACEEXEC = libc::PTRACE_O_TRACEEXEC as u32;
        const TRACEVFORKDONE = libc::PTRACE_O_TRACEVFORKDONE as u32;
        const TRACEEXIT = libc::PTRACE_O_TRACEEXIT as u32;
        const TRACESECCOMP = libc::PTRACE_O_TRACESECCOMP as u32;
        const EXITKILL = libc::PTRACE_O_EXITKILL as u32;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitState {
    DoesntWait,
    /// The wait(2) goes to the kernel: none of our ptracees is concerned.
    WaitsInKernel,
    /// The wait(2) was voided and is answered at its exit stage.
    WaitsInVroot,
}

impl Default for WaitState {
    fn default() -> Self {
        WaitState::DoesntWait
    }
}

/// A tracee seen as an emulated ptracer.
#[derive(Clone, Debug, Default)]
pub struct PtracerState {
    pub nb_ptracees: usize,
    /// The pid argument of the wait(2) the ptracer is blocked in, 0 when
    /// it isn't blocked.
    pub wait_pid: pid_t,
    pub wait_options: i32,
    pub waits_in: WaitState,
    /// Ptracees that are gone, left for the kernel to reap.
    pub zombies: Vec<pid_t>,
}

/// A tracee seen as an emulated ptracee.
#[derive(Clone, Debug, Default)]
pub struct PtraceeState {
    pub ptracer: Option<pid_t>,
    pub options: PtraceOptions,
    /// Restarted with PTRACE_CONT: syscall stops aren't reported.
    pub ignore_syscall: bool,
    /// Kept stopped until its ptracer restarts it.
    pub stopped_for_ptracer: bool,
    /// `wait_status` was not collected by a wait(2) yet.
    pub event_pending: bool,
    /// The status as the ptracer sees it.
    pub wait_status: WaitStatus,
    /// The status as we got it, handled on restart.
    pub vroot_event: Option<WaitStatus>,
}

/// All ptrace requests are voided; unsupported ones fail right away.
pub fn translate_ptrace_enter(tracee: &mut Tracee) -> nix::Result<()> {
    tracee.void_syscall();
    let request = tracee.regs.peek(RegVersion::Current, Reg::Sysarg1) as u32;
    if request == libc::PTRACE_ATTACH {
        log!(
            LogWarn,
            "pid {}: ptrace request {} not supported",
            tracee.pid,
            ptrace_req_name(request)
        );
        return Err(Errno::ENOTSUP);
    }
    Ok(())
}

/// Perform the ptrace request of `tracee` on behalf of it.
pub fn translate_ptrace_exit(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    let request = tracee.regs.peek(RegVersion::Original, Reg::Sysarg1) as u32;
    let pid = tracee.regs.peek_signed(RegVersion::Original, Reg::Sysarg2) as pid_t;
    let addr = tracee.regs.peek(RegVersion::Original, Reg::Sysarg3);
    let data = tracee.regs.peek(RegVersion::Original, Reg::Sysarg4);
    log!(
        LogDebug,
        "pid {}: ptrace({}, {}, {:#x}, {:#x})",
        tracee.pid,
        ptrace_req_name(request),
        pid,
        addr,
        data
    );

    tracee.regs.poke(Reg::SysargResult, 0);
    if request == libc::PTRACE_TRACEME {
        return traceme(tracee, others);
    }

    let ptracer_pid = tracee.pid;
    let ptracee = match others.get_mut(&pid) {
        Some(ptracee)
            if ptracee.as_ptracee.ptracer == Some(ptracer_pid)
                && ptracee.as_ptracee.stopped_for_ptracer =>
        {
            ptracee
        }
        _ => return Err(Errno::ESRCH),
    };

    match request {
        libc::PTRACE_SYSCALL => ptracee.as_ptracee.ignore_syscall = false,
        libc::PTRACE_CONT => ptracee.as_ptracee.ignore_syscall = true,
        libc::PTRACE_SINGLESTEP => {
            ptracee.as_ptracee.ignore_syscall = false;
            ptracee.restart_how = RestartHow::SingleStep;
        }
        libc::PTRACE_DETACH => {
            let vroot_event = ptracee.as_ptracee.vroot_event.take();
            ptracee.as_ptracee = PtraceeState {
                stopped_for_ptracer: true,
                vroot_event,
                ..PtraceeState::default()
            };
            tracee.as_ptracer.nb_ptracees -= 1;
        }
        libc::PTRACE_KILL => {
            kill(Pid::from_raw(pid), Signal::SIGKILL)?;
        }
        libc::PTRACE_SETOPTIONS => {
            ptracee.as_ptracee.options = PtraceOptions::from_bits_truncate(data as u32);
            return Ok(());
        }
        libc::PTRACE_GETEVENTMSG => {
            let mut msg: libc::c_ulong = 0;
            fallible_ptrace(request, pid, 0, &mut msg as *mut libc::c_ulong as usize)?;
            return tracee.poke_mem(RemotePtr::from(data), msg as usize);
        }
        libc::PTRACE_PEEKTEXT | libc::PTRACE_PEEKDATA | libc::PTRACE_PEEKUSER => {
            let word = fallible_ptrace(request, pid, addr, 0)?;
            return tracee.poke_mem(RemotePtr::from(data), word as usize);
        }
        libc::PTRACE_POKETEXT | libc::PTRACE_POKEDATA | libc::PTRACE_POKEUSER => {
            return fallible_ptrace(request, pid, addr, data).map(drop);
        }
        // Only the x86_64 `user_regs_struct` is known here.
        libc::PTRACE_GETREGS | libc::PTRACE_SETREGS if tracee.regs.arch() != SupportedArch::X64 => {
            log!(
                LogWarn,
                "pid {}: {} from 32-bit code not supported",
                tracee.pid,
                ptrace_req_name(request)
            );
            return Err(Errno::EIO);
        }
        libc::PTRACE_GETREGS => {
            let mut regs: user_regs_struct = unsafe { mem::zeroed() };
            fallible_ptrace(request, pid, 0, &mut regs as *mut user_regs_struct as usize)?;
            return tracee.write_data(RemotePtr::from(data), u8_slice(&regs));
        }
        libc::PTRACE_GETSIGINFO => {
            let mut siginfo: siginfo_t = unsafe { mem::zeroed() };
            fallible_ptrace(request, pid, 0, &mut siginfo as *mut siginfo_t as usize)?;
            return tracee.write_data(RemotePtr::from(data), u8_slice(&siginfo));
        }
        libc::PTRACE_SETREGS => {
            let mut regs: user_regs_struct = unsafe { mem::zeroed() };
            tracee.read_data(RemotePtr::from(data), u8_slice_mut(&mut regs))?;
            return fallible_ptrace(request, pid, 0, &regs as *const user_regs_struct as usize)
                .map(drop);
        }
        libc::PTRACE_SETSIGINFO => {
            let mut siginfo: siginfo_t = unsafe { mem::zeroed() };
            tracee.read_data(RemotePtr::from(data), u8_slice_mut(&mut siginfo))?;
            return fallible_ptrace(request, pid, 0, &siginfo as *const siginfo_t as usize)
                .map(drop);
        }
        _ => {
            log!(
                LogWarn,
                "pid {}: ptrace request {} not supported",
                tracee.pid,
                ptrace_req_name(request)
            );
            return Err(Errno::ENOTSUP);
        }
    }

    // Restarting requests only.
    if let Some(mut ptracee) = others.remove(&pid) {
        resume_ptracee(&mut ptracee, others, data as i32);
        others.insert(pid, ptracee);
    }
    Ok(())
}

/// PTRACE_TRACEME: the parent becomes the ptracer.
fn traceme(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    let parent = match tracee.parent {
        Some(parent) if parent != tracee.pid && tracee.as_ptracee.ptracer.is_none() => parent,
        _ => return Err(Errno::EPERM),
    };
    let ptracer = others.get_mut(&parent).ok_or(Errno::EPERM)?;

    if !WARNED_PTRACE_USE.swap(true, Ordering::Relaxed) {
        log!(
            LogWarn,
            "{:?} is using ptrace(2): its support is incomplete and slow",
            tracee.exe
        );
    }
    tracee.as_ptracee.ptracer = Some(parent);
    // Our seccomp stops can't be told apart from the ptracer's syscall
    // stops otherwise.
    tracee.seccomp = SeccompState::Disabled;
    ptracer.as_ptracer.nb_ptracees += 1;

    // The ptracer went to wait in the kernel before it had a ptracee: get
    // it out of there, its wait(2) is restarted and emulated.
    if ptracer.as_ptracer.waits_in == WaitState::WaitsInKernel {
        match kill(Pid::from_raw(parent), Signal::SIGSTOP) {
            Ok(()) => {
                ptracer.sigstop = SigStop::Ignored;
                ptracer.as_ptracer.waits_in = WaitState::WaitsInVroot;
            }
            Err(err) => log!(LogWarn, "can't wake ptracer {}: {}", parent, err),
        }
    }
    Ok(())
}

/// `ptracee` stopped with `status`. True if it's reported to its ptracer
/// and must stay stopped; false if it should be handled as usual.
pub fn handle_ptracee_event(ptracee: &mut Tracee, others: &mut TraceeTable, status: WaitStatus) -> bool {
    let ptracer_pid = match ptracee.as_ptracee.ptracer {
        Some(pid) => pid,
        None => return false,
    };
    if !status.is_stopped() || ptracee.chain.in_progress {
        return false;
    }
    if status.stop_sig() == Some(SIGSTOP) && ptracee.sigstop == SigStop::Ignored {
        return false;
    }

    let options = ptracee.as_ptracee.options;
    let mut reported = status;
    if status.is_syscall() {
        if ptracee.as_ptracee.ignore_syscall {
            return false;
        }
        if !options.contains(PtraceOptions::TRACESYSGOOD) {
            reported = status.without_sysgood();
        }
    } else if let Some(event) = status.ptrace_event() {
        let wanted = match event {
            libc::PTRACE_EVENT_FORK => PtraceOptions::TRACEFORK,
            libc::PTRACE_EVENT_VFORK => PtraceOptions::TRACEVFORK,
            libc::PTRACE_EVENT_CLONE => PtraceOptions::TRACECLONE,
            libc::PTRACE_EVENT_EXEC => PtraceOptions::TRACEEXEC,
            libc::PTRACE_EVENT_VFORK_DONE => PtraceOptions::TRACEVFORKDONE,
            libc::PTRACE_EVENT_EXIT => PtraceOptions::TRACEEXIT,
            _ => return false,
        };
        if !options.contains(wanted) {
            return false;
        }
    }

    let state = &mut ptracee.as_ptracee;
    state.wait_status = reported;
    state.event_pending = true;
    state.stopped_for_ptracer = true;
    state.vroot_event = Some(status);
    log!(
        LogDebug,
        "pid {}: {} held for ptracer {}",
        ptracee.pid,
        reported,
        ptracer_pid
    );

    if let Some(ptracer) = others.get_mut(&ptracer_pid) {
        let wait_pid = ptracer.as_ptracer.wait_pid;
        if wait_pid == ptracee.pid || wait_pid == -1 {
            wait::wake_ptracer(ptracer, ptracee);
        }
    }
    true
}

/// `ptracee` is gone: its ptracer is left with a zombie to reap.
pub fn ptracee_gone(ptracee: &Tracee, others: &mut TraceeTable) {
    let ptracer = match ptracee.as_ptracee.ptracer.and_then(|pid| others.get_mut(&pid)) {
        Some(ptracer) => ptracer,
        None => return,
    };
    ptracer.as_ptracer.nb_ptracees = ptracer.as_ptracer.nb_ptracees.saturating_sub(1);
    ptracer.as_ptracer.zombies.push(ptracee.pid);
    let wait_pid = ptracer.as_ptracer.wait_pid;
    if wait_pid == ptracee.pid || wait_pid == -1 {
        wait::rewind_wait(ptracer);
    }
}

/// The ptracer `pid` is gone: its ptracees go on untraced.
pub fn ptracer_gone(pid: pid_t, others: &mut TraceeTable) {
    let ptracees: Vec<pid_t> = others
        .values()
        .filter(|t| t.as_ptracee.ptracer == Some(pid))
        .map(|t| t.pid)
        .collect();
    for ptracee_pid in ptracees {
        let mut ptracee = match others.remove(&ptracee_pid) {
            Some(ptracee) => ptracee,
            None => continue,
        };
        let stopped = ptracee.as_ptracee.stopped_for_ptracer;
        let vroot_event = ptracee.as_ptracee.vroot_event.take();
        ptracee.as_ptracee = PtraceeState {
            vroot_event,
            ..PtraceeState::default()
        };
        if stopped {
            resume_ptracee(&mut ptracee, others, 0);
        }
        others.insert(ptracee_pid, ptracee);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracee::test_support::{fake_tracee, STACK_BASE};
    use std::path::Path;

    fn pair() -> (Tracee, TraceeTable) {
        let mut ptracee = fake_tracee(Path::new("/"), "/");
        ptracee.pid = 20;
        ptracee.parent = Some(10);
        let mut ptracer = fake_tracee(Path::new("/"), "/");
        ptracer.pid = 10;
        let mut others = TraceeTable::new();
        others.insert(10, ptracer);
        (ptracee, others)
    }

    fn traceme_exit(ptracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
        ptracee.regs.poke(Reg::Sysarg1, libc::PTRACE_TRACEME as usize);
        ptracee.regs.save_current(RegVersion::Original);
        translate_ptrace_exit(ptracee, others)
    }

    #[test]
    fn traceme_links_to_parent_once() {
        let (mut ptracee, mut others) = pair();
        ptracee.seccomp = SeccompState::Enabled;
        traceme_exit(&mut ptracee, &mut others).unwrap();
        assert_eq!(Some(10), ptracee.as_ptracee.ptracer);
        assert_eq!(SeccompState::Disabled, ptracee.seccomp);
        assert_eq!(1, others[&10].as_ptracer.nb_ptracees);
        assert_eq!(Err(Errno::EPERM), traceme_exit(&mut ptracee, &mut others));
    }

    #[test]
    fn events_filtered_by_options() {
        let (mut ptracee, mut others) = pair();
        traceme_exit(&mut ptracee, &mut others).unwrap();

        let fork = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_FORK);
        assert!(!handle_ptracee_event(&mut ptracee, &mut others, fork));
        assert!(!ptracee.as_ptracee.stopped_for_ptracer);

        // Syscall stops lose 0x80 without TRACESYSGOOD.
        let syscall = WaitStatus::for_syscall(true);
        assert!(handle_ptracee_event(&mut ptracee, &mut others, syscall));
        assert_eq!(WaitStatus::for_syscall(false), ptracee.as_ptracee.wait_status);
        assert_eq!(Some(syscall), ptracee.as_ptracee.vroot_event);
        assert!(ptracee.as_ptracee.event_pending);

        ptracee.as_ptracee.options = PtraceOptions::TRACEFORK | PtraceOptions::TRACESYSGOOD;
        assert!(handle_ptracee_event(&mut ptracee, &mut others, fork));
        assert_eq!(fork, ptracee.as_ptracee.wait_status);

        ptracee.as_ptracee.ignore_syscall = true;
        assert!(!handle_ptracee_event(&mut ptracee, &mut others, syscall));
    }

    #[test]
    fn untraced_and_exits_are_ours() {
        let (mut ptracee, mut others) = pair();
        assert!(!handle_ptracee_event(&mut ptracee, &mut others, WaitStatus::for_syscall(true)));
        traceme_exit(&mut ptracee, &mut others).unwrap();
        assert!(!handle_ptracee_event(&mut ptracee, &mut others, WaitStatus::for_exit_code(0)));
    }

    #[test]
    fn requests_need_a_stopped_ptracee() {
        let (ptracee, mut others) = pair();
        let mut ptracer = others.remove(&10).unwrap();
        others.insert(20, ptracee);
        ptracer.regs.poke(Reg::Sysarg1, libc::PTRACE_CONT as usize);
        ptracer.regs.poke(Reg::Sysarg2, 20);
        ptracer.regs.save_current(RegVersion::Original);
        assert_eq!(Err(Errno::ESRCH), translate_ptrace_exit(&mut ptracer, &mut others));
    }

    #[test]
    fn compat_ptracer_cannot_use_native_regs() {
        let (mut ptracee, mut others) = pair();
        traceme_exit(&mut ptracee, &mut others).unwrap();
        ptracee.as_ptracee.stopped_for_ptracer = true;
        let mut ptracer = others.remove(&10).unwrap();
        others.insert(20, ptracee);

        let mut raw = *ptracer.regs.get_ptrace();
        raw.cs = 0x23;
        ptracer.regs.set_from_ptrace(&raw);
        for &request in &[libc::PTRACE_GETREGS, libc::PTRACE_SETREGS] {
            ptracer.regs.poke(Reg::Sysarg1, request as usize);
            ptracer.regs.poke(Reg::Sysarg2, 20);
            ptracer.regs.poke(Reg::Sysarg4, STACK_BASE);
            ptracer.regs.save_current(RegVersion::Original);
            assert_eq!(Err(Errno::EIO), translate_ptrace_exit(&mut ptracer, &mut others));
        }
        assert!(others[&20].as_ptracee.stopped_for_ptracer);
    }

    #[test]
    fn setoptions_does_not_restart() {
        let (mut ptracee, mut others) = pair();
        traceme_exit(&mut ptracee, &mut others).unwrap();
        ptracee.as_ptracee.stopped_for_ptracer = true;
        let mut ptracer = others.remove(&10).unwrap();
        others.insert(20, ptracee);

        ptracer.regs.poke(Reg::Sysarg1, libc::PTRACE_SETOPTIONS as usize);
        ptracer.regs.poke(Reg::Sysarg2, 20);
        ptracer.regs.poke(Reg::Sysarg4, libc::PTRACE_O_TRACESYSGOOD as usize);
        ptracer.regs.save_current(RegVersion::Original);
        translate_ptrace_exit(&mut ptracer, &mut others).unwrap();
        assert_eq!(PtraceOptions::TRACESYSGOOD, others[&20].as_ptracee.options);
        assert!(others[&20].as_ptracee.stopped_for_ptracer);
    }
}
