//! Word-granular access to a tracee's address space.
//!
//! ptrace only moves one host word at a time. Everything else (byte
//! buffers, C strings, partial words) is built on top of `peek_word` and
//! `poke_word`, merging partial words so that bytes outside the requested
//! range are written back unchanged.

use crate::remote_ptr::{RemotePtr, Void};
use libc::pid_t;
use memchr::memchr;
use nix::errno::{errno, Errno};
use std::{cmp::min, mem::size_of, ptr};

const WORD_SIZE: usize = size_of::<usize>();

pub trait MemoryBackend {
    fn peek_word(&self, addr: usize) -> nix::Result<usize>;
    fn poke_word(&mut self, addr: usize, word: usize) -> nix::Result<()>;
}

/// The real thing: PTRACE_PEEKDATA / PTRACE_POKEDATA on a stopped tracee.
pub struct PtraceMemory {
    pid: pid_t,
}

impl PtraceMemory {
    pub fn new(pid: pid_t) -> PtraceMemory {
        PtraceMemory { pid }
    }
}

/// A vanished tracee stays ESRCH, anything else is a bad address.
fn memory_error(err: Errno) -> Errno {
    match err {
        Errno::ESRCH => Errno::ESRCH,
        _ => Errno::EFAULT,
    }
}

impl MemoryBackend for PtraceMemory {
    fn peek_word(&self, addr: usize) -> nix::Result<usize> {
        // -1 is a valid word: errno is the only way to tell.
        unsafe { *libc::__errno_location() = 0 };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                self.pid,
                addr as *mut libc::c_void,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if ret == -1 && errno() != 0 {
            return Err(memory_error(Errno::last()));
        }
        Ok(ret as usize)
    }

    fn poke_word(&mut self, addr: usize, word: usize) -> nix::Result<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid,
                addr as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };
        Errno::result(ret).map(drop).map_err(memory_error)
    }
}

/// Copy `buf.len()` bytes from the tracee at `addr`.
pub fn read_data(
    mem: &dyn MemoryBackend,
    addr: RemotePtr<Void>,
    buf: &mut [u8],
) -> nix::Result<()> {
    let mut word_addr = addr.as_usize() & !(WORD_SIZE - 1);
    let mut offset = addr.as_usize() - word_addr;
    let mut done = 0;
    while done < buf.len() {
        let word = mem.peek_word(word_addr)?.to_ne_bytes();
        let nb = min(WORD_SIZE - offset, buf.len() - done);
        buf[done..done + nb].copy_from_slice(&word[offset..offset + nb]);
        done += nb;
        offset = 0;
        word_addr += WORD_SIZE;
    }
    Ok(())
}

/// Copy `data` into the tracee at `addr`. Bytes sharing a word with the
/// first or the last byte of the range are preserved.
pub fn write_data(
    mem: &mut dyn MemoryBackend,
    addr: RemotePtr<Void>,
    data: &[u8],
) -> nix::Result<()> {
    let mut word_addr = addr.as_usize() & !(WORD_SIZE - 1);
    let mut offset = addr.as_usize() - word_addr;
    let mut done = 0;
    while done < data.len() {
        let nb = min(WORD_SIZE - offset, data.len() - done);
        let mut word = if nb == WORD_SIZE {
            [0u8; WORD_SIZE]
        } else {
            mem.peek_word(word_addr)?.to_ne_bytes()
        };
        word[offset..offset + nb].copy_from_slice(&data[done..done + nb]);
        mem.poke_word(word_addr, usize::from_ne_bytes(word))?;
        done += nb;
        offset = 0;
        word_addr += WORD_SIZE;
    }
    Ok(())
}

/// Copy a NUL terminated string from the tracee into `buf`.
///
/// Returns the number of bytes copied, terminator included. When no
/// terminator shows up within `buf.len()` bytes, `buf.len()` is returned
/// and the caller decides whether that's an overflow.
pub fn read_string(
    mem: &dyn MemoryBackend,
    addr: RemotePtr<Void>,
    buf: &mut [u8],
) -> nix::Result<usize> {
    let mut word_addr = addr.as_usize() & !(WORD_SIZE - 1);
    let mut offset = addr.as_usize() - word_addr;
    let mut done = 0;
    while done < buf.len() {
        let word = mem.peek_word(word_addr)?.to_ne_bytes();
        let nb = min(WORD_SIZE - offset, buf.len() - done);
        let chunk = &word[offset..offset + nb];
        if let Some(nul) = memchr(0, chunk) {
            buf[done..=done + nul].copy_from_slice(&chunk[..=nul]);
            return Ok(done + nul + 1);
        }
        buf[done..done + nb].copy_from_slice(chunk);
        done += nb;
        offset = 0;
        word_addr += WORD_SIZE;
    }
    Ok(buf.len())
}

/// A slice of local memory pretending to live at `base` in a tracee.
#[cfg(test)]
pub struct LocalMemory {
    pub base: usize,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl LocalMemory {
    pub fn new(base: usize, size: usize) -> LocalMemory {
        LocalMemory {
            base,
            bytes: vec![0xaa; size],
        }
    }

    fn range(&self, addr: usize) -> nix::Result<std::ops::Range<usize>> {
        if addr < self.base || addr + WORD_SIZE > self.base + self.bytes.len() {
            return Err(Errno::EFAULT);
        }
        Ok(addr - self.base..addr - self.base + WORD_SIZE)
    }
}

#[cfg(test)]
impl MemoryBackend for LocalMemory {
    fn peek_word(&self, addr: usize) -> nix::Result<usize> {
        let range = self.range(addr)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&self.bytes[range]);
        Ok(usize::from_ne_bytes(word))
    }

    fn poke_word(&mut self, addr: usize, word: usize) -> nix::Result<()> {
        let range = self.range(addr)?;
        self.bytes[range].copy_from_slice(&word.to_ne_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10000;

    fn rptr(addr: usize) -> RemotePtr<Void> {
        RemotePtr::from(addr)
    }

    #[test]
    fn unaligned_write_preserves_neighbours() {
        let mut mem = LocalMemory::new(BASE, 64);
        write_data(&mut mem, rptr(BASE + 3), b"hello world").unwrap();
        assert_eq!(&[0xaa, 0xaa, 0xaa], &mem.bytes[..3]);
        assert_eq!(b"hello world", &mem.bytes[3..14]);
        assert!(mem.bytes[14..].iter().all(|&b| b == 0xaa));

        let mut back = [0u8; 11];
        read_data(&mem, rptr(BASE + 3), &mut back).unwrap();
        assert_eq!(b"hello world", &back);
    }

    #[test]
    fn write_inside_one_word() {
        let mut mem = LocalMemory::new(BASE, 16);
        write_data(&mut mem, rptr(BASE + 2), b"xy").unwrap();
        assert_eq!(&[0xaa, 0xaa, b'x', b'y', 0xaa, 0xaa, 0xaa, 0xaa], &mem.bytes[..8]);
    }

    #[test]
    fn string_stops_at_nul() {
        let mut mem = LocalMemory::new(BASE, 64);
        write_data(&mut mem, rptr(BASE + 5), b"/etc/passwd\0garbage").unwrap();
        let mut buf = [0u8; 32];
        let n = read_string(&mem, rptr(BASE + 5), &mut buf).unwrap();
        assert_eq!(12, n);
        assert_eq!(b"/etc/passwd\0", &buf[..n]);
    }

    #[test]
    fn string_bounded_by_buffer() {
        let mut mem = LocalMemory::new(BASE, 64);
        write_data(&mut mem, rptr(BASE), b"0123456789abcdef").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(10, read_string(&mem, rptr(BASE), &mut buf).unwrap());
        assert_eq!(b"0123456789", &buf);
    }

    #[test]
    fn out_of_range_is_efault() {
        let mem = LocalMemory::new(BASE, 16);
        let mut buf = [0u8; 4];
        assert_eq!(Err(Errno::EFAULT), read_data(&mem, rptr(BASE + 14), &mut buf));
        assert_eq!(Err(Errno::EFAULT), read_data(&mem, rptr(8), &mut buf));
    }
}
