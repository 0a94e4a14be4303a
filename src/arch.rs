use libc::user_regs_struct;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("vroot only supports x86_64 hosts (with i386 tracees)");

/// The ABI a tracee is executing under at a given stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SupportedArch {
    X86,
    X64,
}

impl Default for SupportedArch {
    fn default() -> Self {
        Self::X64
    }
}

/// `cs` value of a 64-bit kernel running 32-bit user code.
const X86_COMPAT_CS: u64 = 0x23;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
const AUDIT_ARCH_I386: u32 = 0x4000_0003;

impl SupportedArch {
    /// 32-on-64 tracees are recognised from their code segment.
    pub fn detect(regs: &user_regs_struct) -> SupportedArch {
        if regs.cs == X86_COMPAT_CS {
            SupportedArch::X86
        } else {
            SupportedArch::X64
        }
    }

    pub fn layout(self) -> &'static dyn RegisterLayout {
        match self {
            SupportedArch::X86 => &X86Arch,
            SupportedArch::X64 => &X64Arch,
        }
    }
}

/// Abstract register roles. Identical on every architecture.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Reg {
    SysargNum,
    Sysarg1,
    Sysarg2,
    Sysarg3,
    Sysarg4,
    Sysarg5,
    Sysarg6,
    SysargResult,
    StackPointer,
    InstrPointer,
}

impl Reg {
    /// `Reg::sysarg(1)` is `Sysarg1`, etc.
    pub fn sysarg(n: usize) -> Reg {
        match n {
            1 => Reg::Sysarg1,
            2 => Reg::Sysarg2,
            3 => Reg::Sysarg3,
            4 => Reg::Sysarg4,
            5 => Reg::Sysarg5,
            6 => Reg::Sysarg6,
            _ => fatal!("There is no syscall argument #{}", n),
        }
    }
}

/// Where each register role lives in the kernel's register structure.
pub trait RegisterLayout {
    fn arch(&self) -> SupportedArch;

    /// Size of a tracee word (pointer, `long`).
    fn word_size(&self) -> usize;

    /// `AUDIT_ARCH_*` value seen by seccomp filters.
    fn audit_arch(&self) -> u32;

    fn slot<'a>(&self, regs: &'a mut user_regs_struct, reg: Reg) -> &'a mut u64;

    fn get(&self, regs: &user_regs_struct, reg: Reg) -> usize {
        let mut copy = *regs;
        let value = *self.slot(&mut copy, reg);
        if self.word_size() == 4 {
            (value & 0xffff_ffff) as usize
        } else {
            value as usize
        }
    }

    fn set(&self, regs: &mut user_regs_struct, reg: Reg, value: usize) {
        let value = if self.word_size() == 4 {
            value as u64 & 0xffff_ffff
        } else {
            value as u64
        };
        *self.slot(regs, reg) = value;
    }

    /// Largest value a stack pointer can hold.
    fn max_address(&self) -> usize {
        if self.word_size() == 4 {
            u32::MAX as usize
        } else {
            usize::MAX
        }
    }
}

pub struct X86Arch;
pub struct X64Arch;

impl RegisterLayout for X64Arch {
    fn arch(&self) -> SupportedArch {
        SupportedArch::X64
    }

    fn word_size(&self) -> usize {
        8
    }

    fn audit_arch(&self) -> u32 {
        AUDIT_ARCH_X86_64
    }

    fn slot<'a>(&self, regs: &'a mut user_regs_struct, reg: Reg) -> &'a mut u64 {
        match reg {
            Reg::SysargNum => &mut regs.orig_rax,
            Reg::Sysarg1 => &mut regs.rdi,
            Reg::Sysarg2 => &mut regs.rsi,
            Reg::Sysarg3 => &mut regs.rdx,
            Reg::Sysarg4 => &mut regs.r10,
            Reg::Sysarg5 => &mut regs.r8,
            Reg::Sysarg6 => &mut regs.r9,
            Reg::SysargResult => &mut regs.rax,
            Reg::StackPointer => &mut regs.rsp,
            Reg::InstrPointer => &mut regs.rip,
        }
    }
}

/// i386 tracee on an x86_64 kernel: the 32-bit registers are the low
/// halves of the 64-bit ones.
impl RegisterLayout for X86Arch {
    fn arch(&self) -> SupportedArch {
        SupportedArch::X86
    }

    fn word_size(&self) -> usize {
        4
    }

    fn audit_arch(&self) -> u32 {
        AUDIT_ARCH_I386
    }

    fn slot<'a>(&self, regs: &'a mut user_regs_struct, reg: Reg) -> &'a mut u64 {
        match reg {
            Reg::SysargNum => &mut regs.orig_rax,
            Reg::Sysarg1 => &mut regs.rbx,
            Reg::Sysarg2 => &mut regs.rcx,
            Reg::Sysarg3 => &mut regs.rdx,
            Reg::Sysarg4 => &mut regs.rsi,
            Reg::Sysarg5 => &mut regs.rdi,
            Reg::Sysarg6 => &mut regs.rbp,
            Reg::SysargResult => &mut regs.rax,
            Reg::StackPointer => &mut regs.rsp,
            Reg::InstrPointer => &mut regs.rip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> user_regs_struct {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn detect_compat() {
        let mut regs = zeroed();
        regs.cs = 0x33;
        assert_eq!(SupportedArch::X64, SupportedArch::detect(&regs));
        regs.cs = 0x23;
        assert_eq!(SupportedArch::X86, SupportedArch::detect(&regs));
    }

    #[test]
    fn x64_roles() {
        let layout = SupportedArch::X64.layout();
        let mut regs = zeroed();
        layout.set(&mut regs, Reg::Sysarg4, 0x1234);
        assert_eq!(0x1234, regs.r10);
        assert_eq!(0x1234, layout.get(&regs, Reg::Sysarg4));
    }

    #[test]
    fn x86_roles_are_masked() {
        let layout = SupportedArch::X86.layout();
        let mut regs = zeroed();
        regs.rbx = 0xffff_ffff_0000_0010;
        assert_eq!(0x10, layout.get(&regs, Reg::Sysarg1));
        layout.set(&mut regs, Reg::SysargResult, usize::MAX);
        assert_eq!(0xffff_ffff, regs.rax);
        assert_eq!(u32::MAX as usize, layout.max_address());
    }
}
