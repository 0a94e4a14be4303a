//! `execve` of a guest program.
//!
//! The kernel resolves the program path, the `#!` interpreter of scripts
//! and the ELF `PT_INTERP` loader on its own, on the host. All three have
//! to be guest paths, so scripts are unwrapped here (the interpreter
//! becomes the program and argv is rebuilt like the kernel would) until a
//! real binary is reached.

use crate::{
    arch::Reg,
    log::LogLevel::LogDebug,
    path::translate::translate_path,
    registers::RegVersion,
    remote_ptr::RemotePtr,
    tracee::{Tracee, TraceeTable},
    util::page_size,
};
use goblin::{
    container::Ctx,
    elf::{program_header::PT_INTERP, Elf, ProgramHeader},
};
use libc::AT_FDCWD;
use memchr::memchr;
use nix::{
    errno::Errno,
    sys::stat::{stat, SFlag},
    unistd::{access, AccessFlags},
};
use std::{
    ffi::OsStr,
    fs::File,
    io::{self, Read},
    os::unix::{ffi::OsStrExt, fs::FileExt},
    path::{Path, PathBuf},
};

/// Like the kernel's BINPRM_MAX_RECURSION.
const MAX_SHEBANG_DEPTH: usize = 4;
/// Upper bound on one argv string.
const MAX_ARG_STRLEN: usize = 128 * 1024;
const MAX_ARGS: usize = 0x10000;

fn io_errno(err: io::Error) -> Errno {
    Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO))
}

pub fn translate_execve(tracee: &mut Tracee, others: &TraceeTable) -> nix::Result<()> {
    let user_path = tracee.get_sysarg_path(Reg::Sysarg1)?.ok_or(Errno::EFAULT)?;
    if user_path.as_os_str().is_empty() {
        return Err(Errno::ENOENT);
    }

    let mut program = user_path;
    let mut argv: Option<Vec<Vec<u8>>> = None;
    let mut depth = 0;
    let translation = loop {
        let translation = translate_path(tracee, others, AT_FDCWD, &program, true)?;
        check_executable(&translation.host)?;
        let head = read_head(&translation.host)?;

        let (interp, arg) = match parse_shebang(&head)? {
            Some(shebang) => shebang,
            None => {
                if head.starts_with(b"\x7fELF") {
                    check_elf_interp(tracee, others, &translation.host, &head)?;
                }
                break translation;
            }
        };
        depth += 1;
        if depth > MAX_SHEBANG_DEPTH {
            return Err(Errno::ELOOP);
        }

        let previous = match argv.take() {
            Some(previous) => previous,
            None => read_argv(tracee)?,
        };
        let mut new_argv = vec![interp.clone()];
        new_argv.extend(arg);
        new_argv.push(program.as_os_str().as_bytes().to_vec());
        new_argv.extend(previous.into_iter().skip(1));
        argv = Some(new_argv);
        program = PathBuf::from(OsStr::from_bytes(&interp));
    };

    if let Some(argv) = argv {
        write_argv(tracee, &argv)?;
    }
    log!(
        LogDebug,
        "pid {}: execve {:?} -> {:?}",
        tracee.pid,
        translation.guest,
        translation.host
    );
    tracee.set_sysarg_path(Reg::Sysarg1, &translation.host)?;
    tracee.new_exe = Some(translation.guest);
    Ok(())
}

fn check_executable(host: &Path) -> nix::Result<()> {
    let st = stat(host)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFREG {
        return Err(Errno::EACCES);
    }
    access(host, AccessFlags::X_OK).map_err(|_| Errno::EACCES)
}

/// The first page of the program, enough for a `#!` line and an ELF header.
fn read_head(host: &Path) -> nix::Result<Vec<u8>> {
    let file = File::open(host).map_err(io_errno)?;
    let mut head = Vec::with_capacity(page_size());
    file.take(page_size() as u64)
        .read_to_end(&mut head)
        .map_err(io_errno)?;
    Ok(head)
}

/// Interpreter and optional argument of a `#!` line. The line must end
/// within `data`.
pub fn parse_shebang(data: &[u8]) -> nix::Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
    if !data.starts_with(b"#!") {
        return Ok(None);
    }
    let end = memchr(b'\n', data).ok_or(Errno::ENOEXEC)?;
    let is_blank = |c: &u8| *c == b' ' || *c == b'\t';
    let line = &data[2..end];

    let start = line.iter().position(|c| !is_blank(c)).unwrap_or(line.len());
    let line = &line[start..];
    let interp_len = line.iter().position(is_blank).unwrap_or(line.len());
    if interp_len == 0 {
        return Err(Errno::ENOEXEC);
    }
    let interp = line[..interp_len].to_vec();

    // The kernel passes the rest of the line as a single argument.
    let rest = &line[interp_len..];
    let arg = match rest.iter().position(|c| !is_blank(c)) {
        Some(first) => {
            let last = rest.iter().rposition(|c| !is_blank(c)).unwrap_or(first);
            Some(rest[first..=last].to_vec())
        }
        None => None,
    };
    Ok(Some((interp, arg)))
}

/// The dynamic loader of an ELF program must exist in the guest.
fn check_elf_interp(tracee: &mut Tracee, others: &TraceeTable, host: &Path, head: &[u8]) -> nix::Result<()> {
    let interp = match elf_interp(host, head) {
        Ok(interp) => interp,
        Err(err) => {
            log!(LogDebug, "{:?}: not a valid ELF file: {}", host, err);
            return Err(Errno::ENOEXEC);
        }
    };
    let interp = match interp {
        Some(interp) => interp,
        None => return Ok(()),
    };
    let translation = translate_path(tracee, others, AT_FDCWD, &interp, true)?;
    log!(
        LogDebug,
        "pid {}: ELF interpreter {:?} -> {:?}",
        tracee.pid,
        interp,
        translation.host
    );
    stat(&translation.host).map_err(|_| Errno::ENOENT)?;
    Ok(())
}

fn elf_interp(host: &Path, head: &[u8]) -> Result<Option<PathBuf>, goblin::error::Error> {
    let header = Elf::parse_header(head)?;
    let ctx = Ctx::new(header.container()?, header.endianness()?);
    let file = File::open(host)?;

    let mut phdrs = vec![0u8; header.e_phnum as usize * header.e_phentsize as usize];
    file.read_exact_at(&mut phdrs, header.e_phoff)?;
    let program_headers = ProgramHeader::parse(&phdrs, 0, header.e_phnum as usize, ctx)?;

    let ph = match program_headers.iter().find(|ph| ph.p_type == PT_INTERP) {
        Some(ph) => ph,
        None => return Ok(None),
    };
    let mut interp = vec![0u8; ph.p_filesz as usize];
    file.read_exact_at(&mut interp, ph.p_offset)?;
    let len = memchr(0, &interp).unwrap_or(interp.len());
    interp.truncate(len);
    Ok(Some(PathBuf::from(OsStr::from_bytes(&interp))))
}

/// The tracee's current argv (arg2), an empty list for NULL.
pub fn read_argv(tracee: &Tracee) -> nix::Result<Vec<Vec<u8>>> {
    let mut addr = tracee.regs.peek(RegVersion::Current, Reg::Sysarg2);
    let mut argv = Vec::new();
    if addr == 0 {
        return Ok(argv);
    }
    loop {
        let ptr = tracee.peek_mem(RemotePtr::from(addr))?;
        if ptr == 0 {
            return Ok(argv);
        }
        if argv.len() >= MAX_ARGS {
            return Err(Errno::E2BIG);
        }
        let arg = tracee
            .read_c_string(RemotePtr::from(ptr), MAX_ARG_STRLEN)
            .map_err(|err| match err {
                Errno::ENAMETOOLONG => Errno::E2BIG,
                err => err,
            })?;
        argv.push(arg);
        addr += tracee.word_size();
    }
}

/// Copy `argv` on the tracee stack (pointer array first, then the strings)
/// and make arg2 point to it.
fn write_argv(tracee: &mut Tracee, argv: &[Vec<u8>]) -> nix::Result<()> {
    let word = tracee.word_size();
    let array_len = (argv.len() + 1) * word;
    let strings_len: usize = argv.iter().map(|a| a.len() + 1).sum();

    let bottom = tracee.alloc_mem(array_len + strings_len + word)?;
    let array_addr = (bottom.as_usize() + word - 1) & !(word - 1);

    let mut data = Vec::with_capacity(array_len + strings_len);
    let mut string_addr = array_addr + array_len;
    for arg in argv {
        data.extend_from_slice(&string_addr.to_ne_bytes()[..word]);
        string_addr += arg.len() + 1;
    }
    data.extend_from_slice(&0usize.to_ne_bytes()[..word]);
    for arg in argv {
        data.extend_from_slice(arg);
        data.push(0);
    }
    tracee.write_data(RemotePtr::from(array_addr), &data)?;
    tracee.regs.poke(Reg::Sysarg2, array_addr);
    Ok(())
}
