//! wait(2) on emulated ptracees.

use crate::{
    arch::Reg,
    log::LogLevel::{LogDebug, LogWarn},
    ptrace::WaitState,
    registers::RegVersion,
    remote_ptr::RemotePtr,
    syscall::SYSCALL_INSN_SIZE,
    tracee::{Tracee, TraceeTable},
};
use libc::{pid_t, WCONTINUED, WNOHANG, WUNTRACED, __WALL, __WCLONE};
use nix::errno::Errno;
use std::sync::atomic::{AtomicBool, Ordering};

static WARNED_OPTIONS: AtomicBool = AtomicBool::new(false);

const SUPPORTED_OPTIONS: i32 = __WALL | WNOHANG | __WCLONE | WUNTRACED | WCONTINUED;

fn is_ptracee_of(others: &TraceeTable, pid: pid_t, ptracer: pid_t) -> bool {
    others
        .get(&pid)
        .map_or(false, |t| t.as_ptracee.ptracer == Some(ptracer))
}

/// The wait is emulated when it targets one of our ptracees, unless a
/// zombie ptracee is ready: the kernel has to reap that one.
pub fn translate_wait_enter(tracee: &mut Tracee, others: &TraceeTable) -> nix::Result<()> {
    let pid = tracee.regs.peek_signed(RegVersion::Original, Reg::Sysarg1) as pid_t;
    let options = tracee.regs.peek(RegVersion::Original, Reg::Sysarg3) as i32;
    let me = tracee.pid;
    let state = &tracee.as_ptracer;

    let targets_ptracee = match pid {
        -1 => state.nb_ptracees > 0,
        pid if pid > 0 => is_ptracee_of(others, pid, me),
        _ => false,
    };
    let zombie_ready = pid == -1
        && !state.zombies.is_empty()
        && !others
            .values()
            .any(|t| t.as_ptracee.ptracer == Some(me) && t.as_ptracee.event_pending);
    if !targets_ptracee || zombie_ready {
        tracee.as_ptracer.waits_in = WaitState::WaitsInKernel;
        return Ok(());
    }

    if options & !SUPPORTED_OPTIONS != 0 && !WARNED_OPTIONS.swap(true, Ordering::Relaxed) {
        log!(
            LogWarn,
            "pid {}: wait options {:#x} not supported",
            tracee.pid,
            options & !SUPPORTED_OPTIONS
        );
    }
    tracee.void_syscall();
    tracee.as_ptracer.wait_options = options;
    tracee.as_ptracer.waits_in = WaitState::WaitsInVroot;
    Ok(())
}

pub fn translate_wait_exit(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    match std::mem::replace(&mut tracee.as_ptracer.waits_in, WaitState::DoesntWait) {
        WaitState::DoesntWait => return Ok(()),
        WaitState::WaitsInKernel => {
            if !tracee.regs.syscall_failed() {
                let reaped = tracee.regs.syscall_result_signed() as pid_t;
                tracee.as_ptracer.zombies.retain(|&pid| pid != reaped);
            }
            return Ok(());
        }
        WaitState::WaitsInVroot => {}
    }

    let pid = tracee.regs.peek_signed(RegVersion::Original, Reg::Sysarg1) as pid_t;
    let me = tracee.pid;
    let ready = others
        .values()
        .filter(|t| {
            t.as_ptracee.ptracer == Some(me)
                && t.as_ptracee.event_pending
                && (pid == -1 || t.pid == pid)
        })
        .map(|t| t.pid)
        .min();
    if let Some(ready) = ready {
        if let Some(ptracee) = others.get_mut(&ready) {
            return deliver(tracee, ptracee);
        }
    }

    if !tracee.as_ptracer.zombies.is_empty() {
        // A ptracee died meanwhile: go again, through the kernel this time.
        rewind_wait(tracee);
        return Ok(());
    }
    if tracee.as_ptracer.nb_ptracees == 0 {
        return Err(Errno::ECHILD);
    }
    if tracee.as_ptracer.wait_options & WNOHANG != 0 {
        tracee.regs.poke(Reg::SysargResult, 0);
        return Ok(());
    }
    // Blocked until a ptracee event shows up.
    tracee.as_ptracer.wait_pid = pid;
    log!(LogDebug, "pid {}: waiting for ptracee {}", tracee.pid, pid);
    Ok(())
}

/// Complete the wait(2) of `ptracer` with the pending event of `ptracee`.
fn deliver(ptracer: &mut Tracee, ptracee: &mut Tracee) -> nix::Result<()> {
    let status_addr = ptracer.regs.peek(RegVersion::Original, Reg::Sysarg2);
    if status_addr != 0 {
        let status = ptracee.as_ptracee.wait_status.get();
        ptracer.write_data(RemotePtr::from(status_addr), &status.to_ne_bytes())?;
    }
    ptracer.regs.poke(Reg::SysargResult, ptracee.pid as usize);
    ptracee.as_ptracee.event_pending = false;
    Ok(())
}

/// `ptracer` is blocked in an emulated wait(2) that `ptracee` satisfies:
/// complete it and let the ptracer go.
pub fn wake_ptracer(ptracer: &mut Tracee, ptracee: &mut Tracee) {
    ptracer.as_ptracer.wait_pid = 0;
    let result = deliver(ptracer, ptracee)
        .and_then(|()| ptracer.push_regs())
        .and_then(|()| ptracer.restart(0));
    if let Err(err) = result {
        log!(LogWarn, "can't wake ptracer {}: {}", ptracer.pid, err);
    }
}

/// Make the blocked `ptracer` run its wait(2) again.
pub fn rewind_wait(ptracer: &mut Tracee) {
    ptracer.as_ptracer.wait_pid = 0;
    let sysnum = ptracer.regs.peek(RegVersion::Original, Reg::SysargNum);
    ptracer.regs.poke(Reg::SysargNum, sysnum);
    ptracer.regs.poke(Reg::SysargResult, sysnum);
    let ip = ptracer.regs.peek(RegVersion::Current, Reg::InstrPointer);
    ptracer.regs.poke(Reg::InstrPointer, ip - SYSCALL_INSN_SIZE);
    let result = ptracer.push_regs().and_then(|()| ptracer.restart(0));
    if let Err(err) = result {
        log!(LogWarn, "can't restart ptracer {}: {}", ptracer.pid, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::SupportedArch,
        syscall::sysnum::SyscallKind,
        tracee::test_support::{fake_tracee, STACK_BASE},
        wait_status::WaitStatus,
    };
    use std::path::Path;

    fn ptracer_waiting(pid: pid_t, options: i32) -> Tracee {
        let mut ptracer = fake_tracee(Path::new("/"), "/");
        ptracer.pid = 10;
        let wait4 = SyscallKind::Wait4.number(SupportedArch::X64).unwrap();
        ptracer.regs.poke(Reg::SysargNum, wait4);
        ptracer.regs.poke_signed(Reg::Sysarg1, pid as isize);
        ptracer.regs.poke(Reg::Sysarg2, STACK_BASE);
        ptracer.regs.poke(Reg::Sysarg3, options as usize);
        ptracer.regs.save_current(RegVersion::Original);
        ptracer
    }

    fn ptracee(pid: pid_t) -> Tracee {
        let mut ptracee = fake_tracee(Path::new("/"), "/");
        ptracee.pid = pid;
        ptracee.as_ptracee.ptracer = Some(10);
        ptracee
    }

    #[test]
    fn non_ptracees_wait_in_kernel() {
        let mut ptracer = ptracer_waiting(-1, 0);
        translate_wait_enter(&mut ptracer, &TraceeTable::new()).unwrap();
        assert_eq!(WaitState::WaitsInKernel, ptracer.as_ptracer.waits_in);
        assert_eq!(
            SyscallKind::Wait4.number(SupportedArch::X64).unwrap(),
            ptracer.regs.syscallno()
        );
    }

    #[test]
    fn pending_event_is_delivered() {
        let mut ptracer = ptracer_waiting(-1, libc::__WALL);
        ptracer.as_ptracer.nb_ptracees = 1;
        let mut others = TraceeTable::new();
        let mut child = ptracee(20);
        child.as_ptracee.event_pending = true;
        child.as_ptracee.wait_status = WaitStatus::for_stop_sig(libc::SIGSTOP);
        others.insert(20, child);

        translate_wait_enter(&mut ptracer, &others).unwrap();
        assert_eq!(WaitState::WaitsInVroot, ptracer.as_ptracer.waits_in);
        assert_eq!(
            SyscallKind::VOID_SYSNUM,
            ptracer.regs.peek_signed(RegVersion::Current, Reg::SysargNum)
        );

        translate_wait_exit(&mut ptracer, &mut others).unwrap();
        assert_eq!(20, ptracer.regs.syscall_result_signed());
        let mut status = [0u8; 4];
        ptracer.read_data(RemotePtr::from(STACK_BASE), &mut status).unwrap();
        assert_eq!(WaitStatus::for_stop_sig(libc::SIGSTOP).get(), i32::from_ne_bytes(status));
        assert!(!others[&20].as_ptracee.event_pending);
        assert_eq!(WaitState::DoesntWait, ptracer.as_ptracer.waits_in);
    }

    #[test]
    fn nothing_pending() {
        let mut others = TraceeTable::new();
        others.insert(20, ptracee(20));

        let mut ptracer = ptracer_waiting(20, libc::WNOHANG);
        ptracer.as_ptracer.nb_ptracees = 1;
        translate_wait_enter(&mut ptracer, &others).unwrap();
        translate_wait_exit(&mut ptracer, &mut others).unwrap();
        assert_eq!(0, ptracer.regs.syscall_result_signed());
        assert_eq!(0, ptracer.as_ptracer.wait_pid);

        let mut ptracer = ptracer_waiting(20, 0);
        ptracer.as_ptracer.nb_ptracees = 1;
        translate_wait_enter(&mut ptracer, &others).unwrap();
        translate_wait_exit(&mut ptracer, &mut others).unwrap();
        assert_eq!(20, ptracer.as_ptracer.wait_pid);

        let mut ptracer = ptracer_waiting(-1, 0);
        ptracer.as_ptracer.waits_in = WaitState::WaitsInVroot;
        assert_eq!(Err(Errno::ECHILD), translate_wait_exit(&mut ptracer, &mut others));
    }

    #[test]
    fn zombie_goes_to_kernel() {
        let mut others = TraceeTable::new();
        others.insert(21, ptracee(21));
        let mut ptracer = ptracer_waiting(-1, 0);
        ptracer.as_ptracer.nb_ptracees = 1;
        ptracer.as_ptracer.zombies = vec![20];
        translate_wait_enter(&mut ptracer, &others).unwrap();
        assert_eq!(WaitState::WaitsInKernel, ptracer.as_ptracer.waits_in);

        ptracer.regs.poke(Reg::SysargResult, 20);
        translate_wait_exit(&mut ptracer, &mut others).unwrap();
        assert!(ptracer.as_ptracer.zombies.is_empty());
    }
}
