use crate::kernel_metadata::{ptrace_event_name, signal_name};
use libc::{SIGSTOP, SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::{self, Display, Formatter};

/// `PTRACE_EVENT_STOP`, only reported for PTRACE_SEIZE'd tracees.
const PTRACE_EVENT_STOP: i32 = 128;

/// What a `waitpid()` on a tracee reported.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    Exit,
    /// Killed by a signal.
    FatalSignal,
    /// A signal is about to be delivered.
    SignalStop,
    /// PTRACE_EVENT_STOP. Only seen by guests that ptrace with PTRACE_SEIZE.
    GroupStop,
    /// Syscall entry or exit, SIGTRAP | 0x80 thanks to TRACESYSGOOD.
    SyscallStop,
    /// Any other PTRACE_EVENT_*.
    PtraceEvent,
}

/// A raw `wait(2)` status, decoded exactly like the libc macros do.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            WaitType::Exit
        } else if self.fatal_sig().is_some() {
            WaitType::FatalSignal
        } else if self.is_syscall() {
            WaitType::SyscallStop
        } else if self.event_byte() == PTRACE_EVENT_STOP {
            WaitType::GroupStop
        } else if self.ptrace_event().is_some() {
            WaitType::PtraceEvent
        } else {
            WaitType::SignalStop
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    pub fn fatal_sig(&self) -> Option<i32> {
        let termsig = WTERMSIG(self.status);
        if WIFSIGNALED(self.status) && termsig > 0 {
            Some(termsig)
        } else {
            None
        }
    }

    pub fn is_stopped(&self) -> bool {
        WIFSTOPPED(self.status)
    }

    /// The raw stop signal, including the 0x80 bit of syscall stops.
    pub fn raw_stop_sig(&self) -> Option<i32> {
        if WIFSTOPPED(self.status) {
            Some(WSTOPSIG(self.status))
        } else {
            None
        }
    }

    /// Signal of a signal-delivery-stop. A zero signal is reported as SIGSTOP.
    pub fn stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status) || self.event_byte() != 0 || self.is_syscall() {
            return None;
        }
        let sig = WSTOPSIG(self.status) & !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    /// Only valid because PTRACE_O_TRACESYSGOOD is always set on our tracees.
    pub fn is_syscall(&self) -> bool {
        WIFSTOPPED(self.status)
            && self.event_byte() == 0
            && WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    fn event_byte(&self) -> i32 {
        (self.status >> 16) & 0xff
    }

    /// PTRACE_EVENT_* number of a ptrace event stop.
    pub fn ptrace_event(&self) -> Option<i32> {
        let event = self.event_byte();
        if !WIFSTOPPED(self.status) || event == 0 || event == PTRACE_EVENT_STOP {
            None
        } else {
            Some(event)
        }
    }

    /// The same status as a tracer without PTRACE_O_TRACESYSGOOD would see it.
    pub fn without_sysgood(&self) -> WaitStatus {
        if self.is_syscall() {
            WaitStatus {
                status: self.status & !(0x80 << 8),
            }
        } else {
            *self
        }
    }

    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus { status: sig }
    }

    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    pub fn for_syscall(tracesysgood: bool) -> WaitStatus {
        let mut code: i32 = (SIGTRAP << 8) | 0x7f;
        if tracesysgood {
            code |= 0x80 << 8;
        }
        WaitStatus { status: code }
    }

    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap_or(0)),
            WaitType::FatalSignal => write!(
                f,
                " (FATAL-{})",
                signal_name(self.fatal_sig().unwrap_or(0))
            ),
            WaitType::SignalStop => write!(
                f,
                " (STOP-{})",
                signal_name(self.stop_sig().unwrap_or(0))
            ),
            WaitType::GroupStop => write!(
                f,
                " (GROUP-STOP-{})",
                signal_name(self.raw_stop_sig().unwrap_or(0) & !0x80)
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => write!(
                f,
                " ({})",
                ptrace_event_name(self.ptrace_event().unwrap_or(0))
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_and_signal() {
        let st = WaitStatus::for_exit_code(3);
        assert_eq!(WaitType::Exit, st.wait_type());
        assert_eq!(Some(3), st.exit_code());

        let st = WaitStatus::for_fatal_sig(libc::SIGKILL);
        assert_eq!(WaitType::FatalSignal, st.wait_type());
        assert_eq!(Some(libc::SIGKILL), st.fatal_sig());
    }

    #[test]
    fn syscall_stop_and_masking() {
        let st = WaitStatus::for_syscall(true);
        assert_eq!(WaitType::SyscallStop, st.wait_type());
        assert_eq!(Some(SIGTRAP | 0x80), st.raw_stop_sig());

        let masked = st.without_sysgood();
        assert_eq!(WaitStatus::for_syscall(false), masked);
        assert!(!masked.is_syscall());
        assert_eq!(Some(SIGTRAP), masked.stop_sig());
    }

    #[test]
    fn ptrace_events() {
        let st = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_CLONE);
        assert_eq!(WaitType::PtraceEvent, st.wait_type());
        assert_eq!(Some(libc::PTRACE_EVENT_CLONE), st.ptrace_event());
        assert_eq!(None, st.stop_sig());
        assert_eq!(st, st.without_sysgood());
    }

    #[test]
    fn signal_stop() {
        let st = WaitStatus::for_stop_sig(libc::SIGSTOP);
        assert_eq!(WaitType::SignalStop, st.wait_type());
        assert_eq!(Some(libc::SIGSTOP), st.stop_sig());
        assert_eq!("0x137f (STOP-SIGSTOP)", format!("{}", st));
    }
}
