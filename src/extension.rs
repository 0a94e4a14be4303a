//! Extensions hook into every stage of the syscall translation.
//!
//! An extension is notified of [`Event`]s in the order extensions were
//! registered; the first non-zero answer stops the notification and is
//! returned to the caller. What a non-zero answer means depends on the
//! event, see [`Event`].

use crate::{
    flags::Flags,
    registers::RegVersion,
    syscall::sysnum::SyscallKind,
    tracee::Tracee,
    wait_status::WaitStatus,
};
use libc::pid_t;
use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

pub mod cow;
pub mod fake_id0;
pub mod kompat;
pub mod link2symlink;
pub mod mmap_noexec;

/// The exit stage of this syscall has to be seen too.
pub const FILTER_SYSEXIT: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FilteredSysnum {
    pub kind: SyscallKind,
    pub flags: u32,
}

impl FilteredSysnum {
    pub const fn new(kind: SyscallKind, flags: u32) -> FilteredSysnum {
        FilteredSysnum { kind, flags }
    }
}

pub fn is_filtered(list: &[FilteredSysnum], kind: SyscallKind) -> Option<&FilteredSysnum> {
    list.iter().find(|f| f.kind == kind)
}

pub enum Event<'a> {
    /// First tracee is about to start.
    Initialization,
    /// The tracee forked: <0 don't inherit, 0 share this instance, >0 give
    /// the child a fresh one (it then gets `InheritChild`).
    InheritParent,
    InheritChild { parent: pid_t },
    /// <0 deny with this errno, >0 skip the built-in translation.
    SyscallEnterStart,
    /// `status` is the outcome of the translation. <0 overrides it.
    SyscallEnterEnd { status: isize },
    /// <0 force this result, >0 skip the built-in translation.
    SyscallExitStart,
    SyscallExitEnd,
    SyscallChainedEnter,
    SyscallChainedExit,
    /// A path component is about to be looked up on the host. <0 fails the
    /// lookup with this errno.
    HostPath { path: &'a Path, is_final: bool },
    /// A path argument before canonicalization; may be rewritten.
    GuestPath { path: &'a mut PathBuf },
    /// The tracee stopped. Non-zero keeps it stopped.
    NewStatus { status: WaitStatus },
    /// The tracee is gone.
    Removed,
}

pub trait Extension {
    fn name(&self) -> &'static str;

    /// Syscalls this extension needs to stop on when seccomp is active.
    fn filtered_sysnums(&self) -> Vec<FilteredSysnum> {
        Vec::new()
    }

    /// Flags under which this extension follows `kind`, `None` if it
    /// doesn't want to hear about it.
    fn filter_flags(&self, kind: SyscallKind) -> Option<u32> {
        is_filtered(&self.filtered_sysnums(), kind).map(|filtered| filtered.flags)
    }

    fn event(&mut self, tracee: &mut Tracee, event: &mut Event) -> i64;

    /// A fresh instance for a child whose `InheritParent` answer was > 0.
    fn new_instance(&self) -> Option<ExtensionHandle> {
        None
    }
}

pub type ExtensionHandle = Rc<RefCell<dyn Extension>>;

impl Event<'_> {
    fn is_syscall_stage(&self) -> bool {
        matches!(
            self,
            Event::SyscallEnterStart
                | Event::SyscallEnterEnd { .. }
                | Event::SyscallExitStart
                | Event::SyscallExitEnd
        )
    }
}

/// Send `event` to every extension of `tracee`, in order.
///
/// Syscall stage events only reach the extensions following the syscall
/// as the tracee issued it. An extension notified while it is already
/// handling an event (a path translated from inside its own callback) is
/// skipped.
pub fn notify_extensions(tracee: &mut Tracee, event: &mut Event) -> i64 {
    if tracee.extensions.is_empty() {
        return 0;
    }
    let syscall = if event.is_syscall_stage() {
        match tracee.sysnum(RegVersion::Original) {
            Some(kind) => Some(kind),
            None => return 0,
        }
    } else {
        None
    };
    let handles = tracee.extensions.clone();
    for handle in handles {
        let mut extension = match handle.try_borrow_mut() {
            Ok(extension) => extension,
            Err(_) => continue,
        };
        if let Some(kind) = syscall {
            if extension.filter_flags(kind).is_none() {
                continue;
            }
        }
        let status = extension.event(tracee, event);
        if status != 0 {
            return status;
        }
    }
    0
}

/// Does an extension of `tracee` need the exit stage of `kind`?
pub fn extensions_want_sysexit(tracee: &Tracee, kind: SyscallKind) -> bool {
    tracee.extensions.iter().any(|handle| match handle.try_borrow() {
        Ok(extension) => extension
            .filter_flags(kind)
            .map_or(false, |flags| flags & FILTER_SYSEXIT != 0),
        Err(_) => true,
    })
}

/// Give `child` the extensions of `parent`, as each extension decides.
pub fn inherit_extensions(parent: &mut Tracee, child: &mut Tracee) {
    for handle in parent.extensions.clone() {
        let status = match handle.try_borrow_mut() {
            Ok(mut extension) => extension.event(parent, &mut Event::InheritParent),
            Err(_) => continue,
        };
        if status < 0 {
            continue;
        }
        if status == 0 {
            child.extensions.push(handle);
            continue;
        }
        let fresh = match handle.borrow().new_instance() {
            Some(fresh) => fresh,
            None => continue,
        };
        let parent_pid = parent.pid;
        fresh
            .borrow_mut()
            .event(child, &mut Event::InheritChild { parent: parent_pid });
        child.extensions.push(fresh);
    }
}

/// Extensions enabled on the command line, in a fixed order.
pub fn extensions_from_flags(flags: &Flags) -> Vec<ExtensionHandle> {
    let mut list: Vec<ExtensionHandle> = Vec::new();
    if let Some(release) = &flags.kernel_release {
        list.push(Rc::new(RefCell::new(kompat::Kompat::new(release))));
    }
    if let Some((uid, gid)) = flags.fake_id {
        list.push(Rc::new(RefCell::new(fake_id0::FakeId0::new(uid, gid))));
    }
    if flags.link2symlink {
        list.push(Rc::new(RefCell::new(link2symlink::Link2Symlink)));
    }
    if flags.mmap_noexec {
        list.push(Rc::new(RefCell::new(mmap_noexec::MmapNoexec::new())));
    }
    if flags.cow {
        list.push(Rc::new(RefCell::new(cow::Cow)));
    }
    list
}
