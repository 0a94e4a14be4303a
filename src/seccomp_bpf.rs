use crate::{
    arch::SupportedArch,
    extension::{FilteredSysnum, FILTER_SYSEXIT},
    syscall::sysnum::SyscallKind,
};
use libc::sock_filter;
use nix::errno::Errno;
use std::collections::BTreeMap;

// Classic BPF encoding, see linux/filter.h and linux/bpf_common.h.
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

#[repr(C)]
#[allow(non_camel_case_types)]
struct seccomp_data {
    nr: i32,
    arch: u32,
    instruction_pointer: u64,
    args: [u64; 6],
}

assert_eq_size!(seccomp_data, [u8; 64]);

const LENGTH_TRACE_SYSCALL: usize = 2;
const LENGTH_END_SECTION: usize = 1;

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// A seccomp program that traps the syscalls vroot cares about and lets
/// every other syscall run natively.
///
/// Layout, per architecture section:
///
/// ```text
///   ld  [arch]
///   jeq #AUDIT_ARCH, 1, 0
///   ja  next_section
///   ld  [nr]
///   jeq #nr_1, 0, 1      \  repeated for every
///   ret #TRACE|flags_1   /  traced syscall
///   ret #ALLOW
/// ```
///
/// and a final `ret #KILL` for unknown architectures.
#[derive(Clone, Default)]
pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
    section_start: usize,
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        Self::default()
    }

    fn start_arch_section(&mut self, audit_arch: u32, nb_traced_syscalls: usize) {
        let arch_offset = offset_of!(seccomp_data, arch) as u32;
        let syscall_offset = offset_of!(seccomp_data, nr) as u32;
        let section_length = LENGTH_END_SECTION + nb_traced_syscalls * LENGTH_TRACE_SYSCALL;

        self.filters
            .push(bpf_stmt(BPF_LD + BPF_W + BPF_ABS, arch_offset));
        self.filters
            .push(bpf_jump(BPF_JMP + BPF_JEQ + BPF_K, audit_arch, 1, 0));
        self.filters.push(bpf_stmt(
            BPF_JMP + BPF_JA + BPF_K,
            (section_length + 1) as u32,
        ));
        self.filters
            .push(bpf_stmt(BPF_LD + BPF_W + BPF_ABS, syscall_offset));
        self.section_start = self.filters.len();
    }

    fn trace(&mut self, sysnum: u32, flags: u32) {
        self.filters
            .push(bpf_jump(BPF_JMP + BPF_JEQ + BPF_K, sysnum, 0, 1));
        self.filters
            .push(bpf_stmt(BPF_RET + BPF_K, SECCOMP_RET_TRACE | flags));
    }

    fn end_arch_section(&mut self, nb_traced_syscalls: usize) -> nix::Result<()> {
        self.allow();
        if self.filters.len() - self.section_start
            != LENGTH_END_SECTION + nb_traced_syscalls * LENGTH_TRACE_SYSCALL
        {
            return Err(Errno::ERANGE);
        }
        Ok(())
    }

    pub fn allow(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET + BPF_K, SECCOMP_RET_ALLOW));
    }

    fn kill(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET + BPF_K, SECCOMP_RET_KILL));
    }

    /// Compile the filtered syscalls of every architecture into one program.
    pub fn build(sections: &[(SupportedArch, Vec<(u32, u32)>)]) -> nix::Result<SeccompFilter> {
        let mut program = SeccompFilter::new();
        for (arch, syscalls) in sections {
            program.start_arch_section(arch.layout().audit_arch(), syscalls.len());
            for &(sysnum, flags) in syscalls {
                program.trace(sysnum, flags);
            }
            program.end_arch_section(syscalls.len())?;
        }
        program.kill();
        Ok(program)
    }

    /// Install the program on the calling process.
    pub fn install(&self) -> nix::Result<()> {
        let prog = libc::sock_fprog {
            len: self.filters.len() as libc::c_ushort,
            filter: self.filters.as_ptr() as *mut sock_filter,
        };
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        Errno::result(ret)?;
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog,
            )
        };
        Errno::result(ret).map(drop)
    }
}

/// Merge the filtered syscalls of all sources, per architecture. When a
/// syscall appears several times the flags are OR-ed.
pub fn merge_filtered_sysnums(
    lists: &[&[FilteredSysnum]],
) -> Vec<(SupportedArch, Vec<(u32, u32)>)> {
    let mut result = Vec::new();
    for &arch in &[SupportedArch::X64, SupportedArch::X86] {
        let mut merged: BTreeMap<u32, u32> = BTreeMap::new();
        for list in lists {
            for filtered in list.iter() {
                if let Some(nr) = filtered.kind.number(arch) {
                    *merged.entry(nr as u32).or_insert(0) |= filtered.flags;
                }
            }
        }
        result.push((arch, merged.into_iter().collect()));
    }
    result
}

/// Does the trace data of a PTRACE_EVENT_SECCOMP ask for the exit stage?
pub fn wants_sysexit(event_msg: usize) -> bool {
    event_msg as u32 & FILTER_SYSEXIT != 0
}

/// Syscalls the engine itself has to see, whatever the extensions.
pub fn core_filtered_sysnums() -> Vec<FilteredSysnum> {
    use SyscallKind::*;
    let mut list: Vec<FilteredSysnum> = SyscallKind::all()
        .iter()
        .filter(|k| k.has_path_argument())
        .map(|&kind| FilteredSysnum::new(kind, 0))
        .collect();
    for &kind in &[
        Execve,
        Chdir,
        Fchdir,
        Getcwd,
        Readlink,
        Readlinkat,
        Accept,
        Accept4,
        Getsockname,
        Getpeername,
        Wait4,
        Waitpid,
        Ptrace,
    ] {
        list.push(FilteredSysnum::new(kind, FILTER_SYSEXIT));
    }
    for &kind in &[Bind, Connect] {
        list.push(FilteredSysnum::new(kind, 0));
    }
    list
}
