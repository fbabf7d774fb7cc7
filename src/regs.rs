use libc::user_regs_struct;

/// The parts of the tracee's register file that matter at a syscall trap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Syscall number, `-1` when the trap did not come from a syscall.
    pub nr: i64,
    pub args: [u64; 6],
    pub ret: i64,
}

impl Registers {
    pub fn new(nr: i64, args: [u64; 6]) -> Self {
        Self { nr, args, ret: 0 }
    }

    #[cfg(test)]
    pub(crate) fn with_ret(mut self, ret: i64) -> Self {
        self.ret = ret;
        self
    }
}

#[cfg(target_arch = "x86_64")]
impl From<user_regs_struct> for Registers {
    fn from(regs: user_regs_struct) -> Self {
        Self {
            nr: regs.orig_rax as i64,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            ret: regs.rax as i64,
        }
    }
}
