//! `/proc` magic links.
//!
//! The kernel answers `/proc/<pid>/{cwd,exe,root}` with the real state of
//! the process, which is wrong for a tracee: its cwd and exe are emulated
//! and its root is the guest `/`. `fd/<n>` links hold host paths.

use crate::{
    path::{canon::ProcLink, translate::detranslate_path},
    tracee::{Tracee, TraceeTable},
    util::read_link,
};
use libc::pid_t;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// What the magic link `guest` should resolve to for `tracee`, if it is one.
pub fn proc_link(tracee: &Tracee, others: &TraceeTable, guest: &Path) -> nix::Result<Option<ProcLink>> {
    let rest = match guest.strip_prefix("/proc") {
        Ok(rest) => rest,
        Err(_) => return Ok(None),
    };
    let parts: Vec<&OsStr> = rest.iter().collect();

    match parts.as_slice() {
        [who] if *who == "self" => Ok(Some(ProcLink::Target(PathBuf::from(format!(
            "/proc/{}",
            tracee.pid
        ))))),
        [pid, what] => {
            let pid = match parse_pid(pid) {
                Some(pid) => pid,
                None => return Ok(None),
            };
            let owner = if pid == tracee.pid {
                Some(tracee)
            } else {
                others.get(&pid)
            };
            let owner = match owner {
                Some(owner) => owner,
                None => return Ok(host_link(tracee, guest)),
            };
            let link = match what.to_str() {
                Some("cwd") => Some(owner.fs.borrow().cwd.clone()),
                Some("root") => Some(PathBuf::from("/")),
                Some("exe") => owner.exe.clone(),
                _ => return Ok(None),
            };
            Ok(match link {
                Some(target) => Some(ProcLink::Target(target)),
                None => host_link(tracee, guest),
            })
        }
        [pid, fd, n] if *fd == "fd" && parse_pid(pid).is_some() && parse_pid(n).is_some() => {
            Ok(host_link(tracee, guest))
        }
        _ => Ok(None),
    }
}

fn parse_pid(s: &OsStr) -> Option<pid_t> {
    s.to_str()?.parse().ok()
}

/// Ask the kernel and detranslate the answer. Only meaningful when the
/// guest `/proc` is the host one.
fn host_link(tracee: &Tracee, guest: &Path) -> Option<ProcLink> {
    let bindings = tracee.fs.borrow().bindings.clone();
    if bindings.guest_to_host(guest) != guest {
        return None;
    }
    let target = read_link(guest).ok()?;
    if !target.is_absolute() {
        // pipe:[1234], socket:[5678], anon_inode:[eventfd] ...
        return Some(ProcLink::Opaque);
    }
    let guest_target = detranslate_path(&bindings, &target, Some(guest)).unwrap_or(target);
    Some(ProcLink::Target(guest_target))
}
