//! Syscalls vroot knows by name, with their number under each ABI.

use crate::arch::SupportedArch;
use std::collections::HashMap;

macro_rules! syscall_table {
    ($($variant:ident = $name:literal: $x64:expr, $x86:expr;)*) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub enum SyscallKind {
            $($variant,)*
        }

        const ALL_SYSCALLS: &[SyscallKind] = &[$(SyscallKind::$variant,)*];

        impl SyscallKind {
            pub fn name(self) -> &'static str {
                match self {
                    $(SyscallKind::$variant => $name,)*
                }
            }

            fn numbers(self) -> (Option<usize>, Option<usize>) {
                match self {
                    $(SyscallKind::$variant => ($x64, $x86),)*
                }
            }
        }
    };
}

// i386 id syscalls are the 32-bit id variants (`getuid32` ...); the
// legacy 16-bit ones go through untouched.
syscall_table! {
    Accept = "accept": Some(43), None;
    Accept4 = "accept4": Some(288), Some(364);
    Access = "access": Some(21), Some(33);
    Acct = "acct": Some(163), Some(51);
    Bind = "bind": Some(49), Some(361);
    Capset = "capset": Some(126), Some(185);
    Chdir = "chdir": Some(80), Some(12);
    Chmod = "chmod": Some(90), Some(15);
    Chown = "chown": Some(92), Some(182);
    Chown32 = "chown32": None, Some(212);
    Chroot = "chroot": Some(161), Some(61);
    Clone = "clone": Some(56), Some(120);
    Clone3 = "clone3": Some(435), Some(435);
    Close = "close": Some(3), Some(6);
    Connect = "connect": Some(42), Some(362);
    Creat = "creat": Some(85), Some(8);
    Dup2 = "dup2": Some(33), Some(63);
    Dup3 = "dup3": Some(292), Some(330);
    EpollCreate = "epoll_create": Some(213), Some(254);
    EpollCreate1 = "epoll_create1": Some(291), Some(329);
    Eventfd = "eventfd": Some(284), Some(323);
    Eventfd2 = "eventfd2": Some(290), Some(328);
    Execve = "execve": Some(59), Some(11);
    Faccessat = "faccessat": Some(269), Some(307);
    Fchdir = "fchdir": Some(81), Some(133);
    Fchmodat = "fchmodat": Some(268), Some(306);
    Fchown = "fchown": Some(93), Some(95);
    Fchown32 = "fchown32": None, Some(207);
    Fchownat = "fchownat": Some(260), Some(298);
    Fcntl = "fcntl": Some(72), Some(55);
    Fork = "fork": Some(57), Some(2);
    Fstat = "fstat": Some(5), Some(108);
    Fstat64 = "fstat64": None, Some(197);
    Fstatat64 = "fstatat64": None, Some(300);
    Futimesat = "futimesat": Some(261), Some(299);
    Getcwd = "getcwd": Some(79), Some(183);
    Getegid = "getegid": Some(108), Some(202);
    Geteuid = "geteuid": Some(107), Some(201);
    Getgid = "getgid": Some(104), Some(200);
    Getpeername = "getpeername": Some(52), Some(368);
    Getresgid = "getresgid": Some(120), Some(211);
    Getresuid = "getresuid": Some(118), Some(209);
    Getsockname = "getsockname": Some(51), Some(367);
    Getuid = "getuid": Some(102), Some(199);
    Getxattr = "getxattr": Some(191), Some(229);
    InotifyAddWatch = "inotify_add_watch": Some(254), Some(292);
    InotifyInit = "inotify_init": Some(253), Some(291);
    InotifyInit1 = "inotify_init1": Some(294), Some(332);
    Lchown = "lchown": Some(94), Some(16);
    Lchown32 = "lchown32": None, Some(198);
    Lgetxattr = "lgetxattr": Some(192), Some(230);
    Link = "link": Some(86), Some(9);
    Linkat = "linkat": Some(265), Some(303);
    Listxattr = "listxattr": Some(194), Some(232);
    Llistxattr = "llistxattr": Some(195), Some(233);
    Lremovexattr = "lremovexattr": Some(198), Some(236);
    Lsetxattr = "lsetxattr": Some(189), Some(227);
    Lstat = "lstat": Some(6), Some(107);
    Lstat64 = "lstat64": None, Some(196);
    Mkdir = "mkdir": Some(83), Some(39);
    Mkdirat = "mkdirat": Some(258), Some(296);
    Mknod = "mknod": Some(133), Some(14);
    Mknodat = "mknodat": Some(259), Some(297);
    Mmap = "mmap": Some(9), None;
    Mmap2 = "mmap2": None, Some(192);
    Mount = "mount": Some(165), Some(21);
    Mprotect = "mprotect": Some(10), Some(125);
    NameToHandleAt = "name_to_handle_at": Some(303), Some(341);
    Newfstatat = "newfstatat": Some(262), None;
    Open = "open": Some(2), Some(5);
    Openat = "openat": Some(257), Some(295);
    Pipe = "pipe": Some(22), Some(42);
    Pipe2 = "pipe2": Some(293), Some(331);
    PivotRoot = "pivot_root": Some(155), Some(217);
    Ptrace = "ptrace": Some(101), Some(26);
    Readlink = "readlink": Some(89), Some(85);
    Readlinkat = "readlinkat": Some(267), Some(305);
    Removexattr = "removexattr": Some(197), Some(235);
    Rename = "rename": Some(82), Some(38);
    Renameat = "renameat": Some(264), Some(302);
    Renameat2 = "renameat2": Some(316), Some(353);
    Rmdir = "rmdir": Some(84), Some(40);
    Setfsgid = "setfsgid": Some(123), Some(216);
    Setfsuid = "setfsuid": Some(122), Some(215);
    Setgid = "setgid": Some(106), Some(214);
    Setregid = "setregid": Some(114), Some(204);
    Setresgid = "setresgid": Some(119), Some(210);
    Setresuid = "setresuid": Some(117), Some(208);
    Setreuid = "setreuid": Some(113), Some(203);
    Setuid = "setuid": Some(105), Some(213);
    Setxattr = "setxattr": Some(188), Some(226);
    Signalfd = "signalfd": Some(282), Some(321);
    Signalfd4 = "signalfd4": Some(289), Some(327);
    Stat = "stat": Some(4), Some(106);
    Stat64 = "stat64": None, Some(195);
    Statfs = "statfs": Some(137), Some(99);
    Statfs64 = "statfs64": None, Some(268);
    Swapoff = "swapoff": Some(168), Some(115);
    Swapon = "swapon": Some(167), Some(87);
    Symlink = "symlink": Some(88), Some(83);
    Symlinkat = "symlinkat": Some(266), Some(304);
    Truncate = "truncate": Some(76), Some(92);
    Truncate64 = "truncate64": None, Some(193);
    Umount = "umount": None, Some(22);
    Umount2 = "umount2": Some(166), Some(52);
    Uname = "uname": Some(63), Some(122);
    Unlink = "unlink": Some(87), Some(10);
    Unlinkat = "unlinkat": Some(263), Some(301);
    Uselib = "uselib": Some(134), Some(86);
    Utime = "utime": Some(132), Some(30);
    Utimensat = "utimensat": Some(280), Some(320);
    Utimes = "utimes": Some(235), Some(271);
    Vfork = "vfork": Some(58), Some(190);
    Wait4 = "wait4": Some(61), Some(114);
    Waitpid = "waitpid": None, Some(7);
}

lazy_static! {
    static ref X64_DECODE: HashMap<usize, SyscallKind> = decode_table(SupportedArch::X64);
    static ref X86_DECODE: HashMap<usize, SyscallKind> = decode_table(SupportedArch::X86);
}

fn decode_table(arch: SupportedArch) -> HashMap<usize, SyscallKind> {
    ALL_SYSCALLS
        .iter()
        .filter_map(|&kind| kind.number(arch).map(|nr| (nr, kind)))
        .collect()
}

impl SyscallKind {
    /// The kernel rejects this number with ENOSYS and does nothing else.
    pub const VOID_SYSNUM: isize = -2;

    pub fn all() -> &'static [SyscallKind] {
        ALL_SYSCALLS
    }

    pub fn decode(sysnum: usize, arch: SupportedArch) -> Option<SyscallKind> {
        let table = match arch {
            SupportedArch::X64 => &*X64_DECODE,
            SupportedArch::X86 => &*X86_DECODE,
        };
        table.get(&sysnum).copied()
    }

    /// `None` when the syscall doesn't exist under `arch`.
    pub fn number(self, arch: SupportedArch) -> Option<usize> {
        let (x64, x86) = self.numbers();
        match arch {
            SupportedArch::X64 => x64,
            SupportedArch::X86 => x86,
        }
    }

    /// Syscalls taking at least one path the guest has to be kept inside.
    pub fn has_path_argument(self) -> bool {
        use SyscallKind::*;
        matches!(
            self,
            Access
                | Acct
                | Chmod
                | Chown
                | Chown32
                | Chroot
                | Creat
                | Faccessat
                | Fchmodat
                | Fchownat
                | Fstatat64
                | Futimesat
                | Getxattr
                | InotifyAddWatch
                | Lchown
                | Lchown32
                | Lgetxattr
                | Link
                | Linkat
                | Listxattr
                | Llistxattr
                | Lremovexattr
                | Lsetxattr
                | Lstat
                | Lstat64
                | Mkdir
                | Mkdirat
                | Mknod
                | Mknodat
                | Mount
                | NameToHandleAt
                | Newfstatat
                | Open
                | Openat
                | PivotRoot
                | Readlink
                | Readlinkat
                | Removexattr
                | Rename
                | Renameat
                | Renameat2
                | Rmdir
                | Setxattr
                | Stat
                | Stat64
                | Statfs
                | Statfs64
                | Swapoff
                | Swapon
                | Symlink
                | Symlinkat
                | Truncate
                | Truncate64
                | Umount
                | Umount2
                | Unlink
                | Unlinkat
                | Uselib
                | Utime
                | Utimensat
                | Utimes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_per_abi() {
        assert_eq!(Some(SyscallKind::Open), SyscallKind::decode(2, SupportedArch::X64));
        assert_eq!(Some(SyscallKind::Open), SyscallKind::decode(5, SupportedArch::X86));
        assert_eq!(Some(SyscallKind::Fstatat64), SyscallKind::decode(300, SupportedArch::X86));
        assert_eq!(None, SyscallKind::decode(-2isize as usize, SupportedArch::X64));
    }

    #[test]
    fn numbers_are_unique_per_abi() {
        for &arch in &[SupportedArch::X64, SupportedArch::X86] {
            let numbered = SyscallKind::all()
                .iter()
                .filter(|k| k.number(arch).is_some())
                .count();
            assert_eq!(numbered, decode_table(arch).len());
        }
    }

    #[test]
    fn round_trip() {
        for &kind in SyscallKind::all() {
            if let Some(nr) = kind.number(SupportedArch::X64) {
                assert_eq!(Some(kind), SyscallKind::decode(nr, SupportedArch::X64));
            }
        }
    }
}
