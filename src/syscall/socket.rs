//! Unix socket addresses carry paths too.

use crate::{
    arch::Reg,
    path::translate::{detranslate_bytes, translate_path},
    registers::RegVersion,
    remote_ptr::RemotePtr,
    tracee::{Tracee, TraceeTable},
};
use libc::{sa_family_t, sockaddr_un, AF_UNIX, AT_FDCWD};
use memchr::memchr;
use nix::errno::Errno;
use std::{cmp::min, ffi::OsStr, mem::size_of, os::unix::ffi::OsStrExt, path::Path};

const SOCKADDR_UN_SIZE: usize = size_of::<sockaddr_un>();

assert_eq_size!(sockaddr_un, [u8; 110]);

fn sun_path_offset() -> usize {
    offset_of!(sockaddr_un, sun_path)
}

/// `bind`/`connect`: a named unix socket address gets a host copy on the
/// tracee stack. Abstract sockets and other families are left alone.
pub fn translate_sockaddr_enter(tracee: &mut Tracee, others: &TraceeTable) -> nix::Result<()> {
    let addr = tracee.regs.peek(RegVersion::Current, Reg::Sysarg2);
    let len = tracee.regs.peek(RegVersion::Current, Reg::Sysarg3);
    if addr == 0 || len <= sun_path_offset() || len > SOCKADDR_UN_SIZE {
        return Ok(());
    }

    let mut raw = [0u8; SOCKADDR_UN_SIZE];
    tracee.read_data(RemotePtr::from(addr), &mut raw[..len])?;
    let family = sa_family_t::from_ne_bytes([raw[0], raw[1]]);
    if family as i32 != AF_UNIX || raw[sun_path_offset()] == 0 {
        return Ok(());
    }

    let sun_path = &raw[sun_path_offset()..len];
    let path_len = memchr(0, sun_path).unwrap_or(sun_path.len());
    let guest = Path::new(OsStr::from_bytes(&sun_path[..path_len])).to_path_buf();
    let translation = translate_path(tracee, others, AT_FDCWD, &guest, true)?;
    let host = translation.host.as_os_str().as_bytes();
    if host.len() > SOCKADDR_UN_SIZE - sun_path_offset() {
        return Err(Errno::EINVAL);
    }

    let mut new_addr = [0u8; SOCKADDR_UN_SIZE];
    new_addr[..sun_path_offset()].copy_from_slice(&raw[..sun_path_offset()]);
    new_addr[sun_path_offset()..sun_path_offset() + host.len()].copy_from_slice(host);
    tracee.set_sysarg_data(Reg::Sysarg2, &new_addr)?;
    let new_len = min(sun_path_offset() + host.len() + 1, SOCKADDR_UN_SIZE);
    tracee.regs.poke(Reg::Sysarg3, new_len);
    Ok(())
}

/// `accept`-like syscalls: remember the buffer size given by the tracee,
/// the kernel overwrites it.
pub fn save_addrlen(tracee: &mut Tracee) {
    let size_addr = tracee.regs.peek(RegVersion::Current, Reg::Sysarg3);
    tracee.saved_addrlen = 0;
    if size_addr == 0 {
        return;
    }
    let mut buf = [0u8; 4];
    if tracee.read_data(RemotePtr::from(size_addr), &mut buf).is_ok() {
        tracee.saved_addrlen = i32::from_ne_bytes(buf).max(0) as usize;
    }
}

/// Rewrite the address the kernel returned for `accept`, `accept4`,
/// `getsockname` and `getpeername`. Truncation is reported as `max + 1`
/// in `*addrlen`, so the tracee can tell.
pub fn translate_sockaddr_exit(tracee: &mut Tracee) -> nix::Result<()> {
    if tracee.regs.syscall_failed() {
        return Ok(());
    }
    let addr = tracee.regs.peek(RegVersion::Original, Reg::Sysarg2);
    let size_addr = tracee.regs.peek(RegVersion::Original, Reg::Sysarg3);
    if addr == 0 || size_addr == 0 {
        return Ok(());
    }

    let max = min(tracee.saved_addrlen, SOCKADDR_UN_SIZE);
    let mut size_buf = [0u8; 4];
    tracee.read_data(RemotePtr::from(size_addr), &mut size_buf)?;
    let size = i32::from_ne_bytes(size_buf).max(0) as usize;
    let size = min(size, max);
    if size <= sun_path_offset() {
        return Ok(());
    }

    let mut raw = [0u8; SOCKADDR_UN_SIZE];
    tracee.read_data(RemotePtr::from(addr), &mut raw[..size])?;
    let family = sa_family_t::from_ne_bytes([raw[0], raw[1]]);
    if family as i32 != AF_UNIX || raw[sun_path_offset()] == 0 {
        return Ok(());
    }
    let sun_path = &raw[sun_path_offset()..size];
    let path_len = memchr(0, sun_path).unwrap_or(sun_path.len());

    let bindings = tracee.fs.borrow().bindings.clone();
    let guest = match detranslate_bytes(&bindings, &sun_path[..path_len], None) {
        Some(guest) => guest,
        None => return Ok(()),
    };

    let mut new_addr = vec![0u8; sun_path_offset() + guest.len() + 1];
    new_addr[..sun_path_offset()].copy_from_slice(&raw[..sun_path_offset()]);
    new_addr[sun_path_offset()..sun_path_offset() + guest.len()].copy_from_slice(&guest);
    let (written, reported) = if new_addr.len() > max {
        (max, max + 1)
    } else {
        (new_addr.len(), new_addr.len())
    };
    tracee.write_data(RemotePtr::from(addr), &new_addr[..written])?;
    tracee.write_data(RemotePtr::from(size_addr), &(reported as i32).to_ne_bytes())?;
    Ok(())
}
