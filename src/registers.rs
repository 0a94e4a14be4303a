use crate::arch::{Reg, RegisterLayout, SupportedArch};
use libc::user_regs_struct;

/// Which copy of the register file a read refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegVersion {
    /// As the kernel reported it at syscall entry, before any rewriting.
    Original = 0,
    /// After the built-in translation, before the extensions ran.
    Modified = 1,
    /// Live copy; the only one `poke` writes to.
    Current = 2,
}

/// Register snapshots of one tracee.
///
/// Writes only go to the CURRENT snapshot. They are pushed back to the
/// kernel once per stop, and only if something actually changed.
#[derive(Copy, Clone)]
pub struct Registers {
    arch_: SupportedArch,
    snapshots: [user_regs_struct; 3],
    dirty: bool,
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new(SupportedArch::default())
    }
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        let zero: user_regs_struct = unsafe { std::mem::zeroed() };
        Registers {
            arch_: arch,
            snapshots: [zero; 3],
            dirty: false,
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn layout(&self) -> &'static dyn RegisterLayout {
        self.arch_.layout()
    }

    /// Install the register file fetched from the kernel as CURRENT. The ABI
    /// is re-detected since a tracee may switch between 32 and 64-bit code.
    pub fn set_from_ptrace(&mut self, regs: &user_regs_struct) {
        self.arch_ = SupportedArch::detect(regs);
        self.snapshots[RegVersion::Current as usize] = *regs;
        self.dirty = false;
    }

    pub fn get_ptrace(&self) -> &user_regs_struct {
        &self.snapshots[RegVersion::Current as usize]
    }

    pub fn peek(&self, version: RegVersion, reg: Reg) -> usize {
        self.layout().get(&self.snapshots[version as usize], reg)
    }

    /// Signed view, for results and file descriptors.
    pub fn peek_signed(&self, version: RegVersion, reg: Reg) -> isize {
        let value = self.peek(version, reg);
        if self.layout().word_size() == 4 {
            value as u32 as i32 as isize
        } else {
            value as isize
        }
    }

    /// Poking a value that is already there does not dirty the cache.
    pub fn poke(&mut self, reg: Reg, value: usize) {
        if self.peek(RegVersion::Current, reg) == value {
            return;
        }
        let layout = self.layout();
        layout.set(
            &mut self.snapshots[RegVersion::Current as usize],
            reg,
            value,
        );
        self.dirty = true;
    }

    pub fn poke_signed(&mut self, reg: Reg, value: isize) {
        self.poke(reg, value as usize)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Copy CURRENT into `version`.
    pub fn save_current(&mut self, version: RegVersion) {
        debug_assert!(version != RegVersion::Current);
        self.snapshots[version as usize] = self.snapshots[RegVersion::Current as usize];
    }

    /// Put back `reg` as it was in ORIGINAL.
    pub fn restore_original(&mut self, reg: Reg) {
        let value = self.peek(RegVersion::Original, reg);
        self.poke(reg, value);
    }

    pub fn syscallno(&self) -> usize {
        self.peek(RegVersion::Current, Reg::SysargNum)
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.peek_signed(RegVersion::Current, Reg::SysargResult)
    }

    pub fn sp(&self) -> usize {
        self.peek(RegVersion::Current, Reg::StackPointer)
    }

    /// Linux reports failure as a result in [-4095, -1].
    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }
}
