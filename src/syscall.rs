//! The per-syscall state machine.
//!
//! Every syscall of a tracee is seen twice: at entry, its arguments are
//! translated (paths are rewritten to their host location, emulated
//! syscalls are voided); at exit, its results are translated back. The
//! extensions are notified around both stages.

use crate::{
    arch::Reg,
    extension::{notify_extensions, Event},
    log::LogLevel::{LogDebug, LogWarn},
    registers::RegVersion,
    syscall::sysnum::SyscallKind,
    tracee::{SyscallStage, Tracee, TraceeTable},
};
use nix::errno::Errno;

pub mod enter;
pub mod execve;
pub mod exit;
pub mod socket;
pub mod sysnum;

/// Length of both `syscall` and `int $0x80`.
pub const SYSCALL_INSN_SIZE: usize = 2;

/// Handle a syscall-stop of `tracee`. Registers are fetched first and
/// pushed back before returning.
pub fn translate_syscall(tracee: &mut Tracee, others: &mut TraceeTable) -> nix::Result<()> {
    tracee.fetch_regs()?;
    match tracee.stage {
        SyscallStage::Exit => {
            syscall_exit(tracee, others);
            tracee.stage = SyscallStage::NotInSyscall;
        }
        SyscallStage::NotInSyscall | SyscallStage::Enter => {
            tracee.stage = SyscallStage::Enter;
            syscall_enter(tracee, others);
            tracee.stage = SyscallStage::Exit;
        }
    }
    tracee.push_regs()
}

/// The exit stage of the current syscall won't be seen (seccomp said so):
/// release its stack space now.
pub fn skip_syscall_exit(tracee: &mut Tracee) {
    ed_assert_eq!(tracee, tracee.stage, SyscallStage::Exit);
    tracee.regs.restore_original(Reg::StackPointer);
    tracee.stage = SyscallStage::NotInSyscall;
}

fn errno_status(status: i64) -> Errno {
    Errno::from_i32(-status as i32)
}

fn syscall_enter(tracee: &mut Tracee, others: &mut TraceeTable) {
    if tracee.chain.in_progress {
        notify_extensions(tracee, &mut Event::SyscallChainedEnter);
        return;
    }

    tracee.regs.save_current(RegVersion::Original);
    tracee.status = 0;
    if is_logging!(LogDebug) {
        let r = |reg| tracee.regs.peek(RegVersion::Current, reg);
        log!(
            LogDebug,
            "pid {}: {}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}) [sp {:#x}]",
            tracee.pid,
            tracee.syscall_name(),
            r(Reg::Sysarg1),
            r(Reg::Sysarg2),
            r(Reg::Sysarg3),
            r(Reg::Sysarg4),
            r(Reg::Sysarg5),
            r(Reg::Sysarg6),
            tracee.regs.sp()
        );
    }

    let status = notify_extensions(tracee, &mut Event::SyscallEnterStart);
    let result = if status < 0 {
        Err(errno_status(status))
    } else if status > 0 {
        Ok(())
    } else {
        enter::translate_enter(tracee, others)
    };

    tracee.regs.save_current(RegVersion::Modified);
    if let Err(err) = result {
        tracee.status = -(err as isize);
    }

    let status = notify_extensions(
        tracee,
        &mut Event::SyscallEnterEnd {
            status: tracee.status,
        },
    );
    if status < 0 {
        tracee.status = status as isize;
    }

    if tracee.status < 0 {
        log!(
            LogDebug,
            "pid {}: {} denied: {}",
            tracee.pid,
            tracee.syscall_name(),
            errno_status(tracee.status as i64)
        );
        tracee.void_syscall();
    }
}

fn syscall_exit(tracee: &mut Tracee, others: &mut TraceeTable) {
    if tracee.chain.in_progress {
        notify_extensions(tracee, &mut Event::SyscallChainedExit);
        if !replay_next_chained(tracee) {
            end_chain(tracee);
        }
        return;
    }

    let status = notify_extensions(tracee, &mut Event::SyscallExitStart);
    if status < 0 {
        tracee.regs.poke_signed(Reg::SysargResult, status as isize);
    } else if status == 0 {
        if tracee.status < 0 {
            tracee.regs.poke_signed(Reg::SysargResult, tracee.status);
        } else if let Err(err) = exit::translate_exit(tracee, others) {
            tracee.regs.poke_signed(Reg::SysargResult, -(err as isize));
        }
    }

    // The kernel gave a successful execve a brand new stack.
    let new_program = tracee.sysnum(RegVersion::Original) == Some(SyscallKind::Execve)
        && !tracee.regs.syscall_failed();
    if !new_program {
        tracee.regs.restore_original(Reg::StackPointer);
    }

    log!(
        LogDebug,
        "pid {}:        -> {:#x} [sp {:#x}]",
        tracee.pid,
        tracee.regs.syscall_result_signed(),
        tracee.regs.sp()
    );

    notify_extensions(tracee, &mut Event::SyscallExitEnd);

    if replay_next_chained(tracee) {
        tracee.chain.in_progress = true;
    }
}

/// Rewind the tracee onto its syscall instruction with the next chained
/// syscall loaded. False if the chain is empty.
fn replay_next_chained(tracee: &mut Tracee) -> bool {
    let next = match tracee.chain.queue.pop_front() {
        Some(next) => next,
        None => return false,
    };
    log!(
        LogDebug,
        "pid {}: chained syscall {}",
        tracee.pid,
        crate::kernel_metadata::syscall_name(next.sysnum, tracee.regs.arch())
    );
    tracee.regs.poke(Reg::SysargNum, next.sysnum);
    for (i, &arg) in next.args.iter().enumerate() {
        tracee.regs.poke(Reg::sysarg(i + 1), arg);
    }
    // On re-execution the syscall number is read from the result register.
    tracee.regs.poke(Reg::SysargResult, next.sysnum);
    let ip = tracee.regs.peek(RegVersion::Current, Reg::InstrPointer);
    tracee.regs.poke(Reg::InstrPointer, ip - SYSCALL_INSN_SIZE);
    true
}

/// Back to the tracee's own code: its argument registers as it set them,
/// and the result of the chain.
fn end_chain(tracee: &mut Tracee) {
    ed_assert!(
        tracee,
        tracee.chain.queue.is_empty(),
        "{} chained syscalls left",
        tracee.chain.queue.len()
    );
    tracee.chain.in_progress = false;
    for i in 1..=6 {
        tracee.regs.restore_original(Reg::sysarg(i));
    }
    tracee.regs.restore_original(Reg::SysargNum);
    if let Some(result) = tracee.chain.final_result.take() {
        tracee.regs.poke_signed(Reg::SysargResult, result);
    }
    if tracee.regs.syscall_failed() {
        log!(
            LogWarn,
            "pid {}: chained syscalls of {} ended with {}",
            tracee.pid,
            tracee.syscall_name(),
            tracee.regs.syscall_result_signed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::SupportedArch, tracee::test_support::fake_tracee};
    use std::path::Path;

    #[test]
    fn chain_rewinds_and_restores() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        tracee.regs.poke(Reg::InstrPointer, 0x1002);
        tracee.regs.poke(Reg::Sysarg1, 7);
        tracee.regs.save_current(RegVersion::Original);
        tracee.regs.poke_signed(Reg::SysargResult, 3);

        tracee
            .register_chained_syscall(SyscallKind::Fcntl, [3, libc::F_SETFD as usize, 1, 0, 0, 0])
            .unwrap();
        tracee.force_chain_final_result(3);
        assert!(replay_next_chained(&mut tracee));
        let fcntl = SyscallKind::Fcntl.number(SupportedArch::X64).unwrap();
        assert_eq!(fcntl, tracee.regs.syscallno());
        assert_eq!(fcntl, tracee.regs.peek(RegVersion::Current, Reg::SysargResult));
        assert_eq!(0x1000, tracee.regs.peek(RegVersion::Current, Reg::InstrPointer));

        // The chained fcntl returned 0; the chain reports dup2's result.
        tracee.regs.poke(Reg::SysargResult, 0);
        assert!(!replay_next_chained(&mut tracee));
        end_chain(&mut tracee);
        assert_eq!(3, tracee.regs.syscall_result_signed());
        assert_eq!(7, tracee.regs.peek(RegVersion::Current, Reg::Sysarg1));
    }

    #[test]
    fn skipped_exit_releases_stack() {
        let mut tracee = fake_tracee(Path::new("/"), "/");
        let sp = tracee.regs.sp();
        tracee.stage = SyscallStage::Exit;
        tracee.alloc_mem(64).unwrap();
        skip_syscall_exit(&mut tracee);
        assert_eq!(sp, tracee.regs.sp());
        assert_eq!(SyscallStage::NotInSyscall, tracee.stage);
    }
}
