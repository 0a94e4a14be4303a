//! Human readable names for kernel constants, for logs and assertion
//! messages.

use crate::{arch::SupportedArch, syscall::sysnum::SyscallKind};
use nix::{errno::Errno, sys::signal::Signal};
use std::convert::TryFrom;

/// Looks `$value` up in a list of libc constants, or formats the fallback.
macro_rules! const_name {
    ($value:expr, $ty:ty, $fallback:literal, [$($name:ident),+ $(,)?]) => {
        match $value {
            $(v if v == libc::$name as $ty => stringify!($name).to_owned(),)+
            v => format!($fallback, v),
        }
    };
}

pub fn syscall_name(sysnum: usize, arch: SupportedArch) -> String {
    match SyscallKind::decode(sysnum, arch) {
        Some(kind) => kind.name().into(),
        None => format!("syscall({})", sysnum as isize),
    }
}

pub fn signal_name(sig: i32) -> String {
    if (32..=64).contains(&sig) {
        return format!("SIGRT{}", sig);
    }
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_owned(),
        Err(_) => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: i32) -> String {
    const_name!(
        event,
        i32,
        "PTRACE_EVENT({})",
        [
            PTRACE_EVENT_FORK,
            PTRACE_EVENT_VFORK,
            PTRACE_EVENT_CLONE,
            PTRACE_EVENT_EXEC,
            PTRACE_EVENT_VFORK_DONE,
            PTRACE_EVENT_EXIT,
            PTRACE_EVENT_SECCOMP,
        ]
    )
}

/// Requests either issued by the engine or emulated for ptracing guests.
pub fn ptrace_req_name(request: u32) -> String {
    const_name!(
        request,
        u32,
        "PTRACE_REQUEST({})",
        [
            PTRACE_TRACEME,
            PTRACE_PEEKTEXT,
            PTRACE_PEEKDATA,
            PTRACE_PEEKUSER,
            PTRACE_POKETEXT,
            PTRACE_POKEDATA,
            PTRACE_POKEUSER,
            PTRACE_CONT,
            PTRACE_KILL,
            PTRACE_SINGLESTEP,
            PTRACE_GETREGS,
            PTRACE_SETREGS,
            PTRACE_GETFPREGS,
            PTRACE_SETFPREGS,
            PTRACE_ATTACH,
            PTRACE_DETACH,
            PTRACE_SYSCALL,
            PTRACE_SETOPTIONS,
            PTRACE_GETEVENTMSG,
            PTRACE_GETSIGINFO,
            PTRACE_SETSIGINFO,
            PTRACE_GETREGSET,
            PTRACE_SETREGSET,
            PTRACE_SEIZE,
            PTRACE_INTERRUPT,
            PTRACE_LISTEN,
        ]
    )
}

pub fn errno_name(err: i32) -> String {
    match Errno::from_i32(err) {
        Errno::UnknownErrno if err != 0 => format!("errno({})", err),
        Errno::UnknownErrno => "SUCCESS".into(),
        e => format!("{:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!("SIGTRAP", signal_name(libc::SIGTRAP));
        assert_eq!("SIGRT34", signal_name(34));
        assert_eq!("signal(0)", signal_name(0));
        assert_eq!("PTRACE_EVENT_CLONE", ptrace_event_name(libc::PTRACE_EVENT_CLONE));
        assert_eq!("PTRACE_EVENT(0)", ptrace_event_name(0));
        assert_eq!("PTRACE_GETEVENTMSG", ptrace_req_name(libc::PTRACE_GETEVENTMSG));
        assert_eq!("PTRACE_REQUEST(99)", ptrace_req_name(99));
        assert_eq!("ENOENT", errno_name(libc::ENOENT));
        assert_eq!("SUCCESS", errno_name(0));
    }

    #[test]
    fn syscall_names() {
        assert_eq!("openat", syscall_name(libc::SYS_openat as usize, SupportedArch::X64));
        assert_eq!("execve", syscall_name(11, SupportedArch::X86));
        assert_eq!("syscall(-2)", syscall_name(-2isize as usize, SupportedArch::X64));
    }
}
