use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

use crate::regs::Registers;

/// The kernel calls a running trace session makes on its tracee.
///
/// Every method must be called from the thread that attached to the tracee.
pub trait Kernel {
    /// Allow the tracee to execute to the next syscall-stop, delivering `sig`.
    fn syscall(&mut self, pid: Pid, sig: Option<Signal>) -> Result<(), Errno>;

    fn wait(&mut self, pid: Pid) -> Result<WaitStatus, Errno>;

    fn registers(&mut self, pid: Pid) -> Result<Registers, Errno>;

    fn siginfo(&mut self, pid: Pid) -> Result<libc::siginfo_t, Errno>;
}

/// `ptrace(2)` and `waitpid(2)`.
#[derive(Debug, Default)]
pub struct Ptrace;

impl Kernel for Ptrace {
    fn syscall(&mut self, pid: Pid, sig: Option<Signal>) -> Result<(), Errno> {
        ptrace::syscall(pid, sig)
    }

    fn wait(&mut self, pid: Pid) -> Result<WaitStatus, Errno> {
        waitpid(pid, None)
    }

    fn registers(&mut self, pid: Pid) -> Result<Registers, Errno> {
        ptrace::getregs(pid).map(Registers::from)
    }

    fn siginfo(&mut self, pid: Pid) -> Result<libc::siginfo_t, Errno> {
        ptrace::getsiginfo(pid)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted kernel for driving the trace loop without a tracee.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Call {
        Syscall(Option<Signal>),
        Wait,
        Registers,
        Siginfo,
    }

    #[derive(Default)]
    pub struct Script {
        stops: VecDeque<Result<WaitStatus, Errno>>,
        regs: VecDeque<Result<Registers, Errno>>,
        siginfo: VecDeque<Result<libc::siginfo_t, Errno>>,
        resume_errors: VecDeque<Errno>,
        pub calls: Vec<Call>,
    }

    impl Script {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn syscall_stop(mut self, pid: Pid, regs: Registers) -> Self {
            self.stops.push_back(Ok(WaitStatus::PtraceSyscall(pid)));
            self.regs.push_back(Ok(regs));
            self
        }

        pub fn signal_stop(mut self, pid: Pid, sig: Signal) -> Self {
            self.stops.push_back(Ok(WaitStatus::Stopped(pid, sig)));
            self.siginfo.push_back(Ok(siginfo(sig)));
            self
        }

        pub fn stop(mut self, status: WaitStatus) -> Self {
            self.stops.push_back(Ok(status));
            self
        }

        pub fn siginfo_error(mut self, errno: Errno) -> Self {
            self.siginfo.push_back(Err(errno));
            self
        }

        pub fn registers_error(mut self, errno: Errno) -> Self {
            self.regs.push_back(Err(errno));
            self
        }

        /// Fail the next resume that reaches the kernel.
        pub fn resume_error(mut self, errno: Errno) -> Self {
            self.resume_errors.push_back(errno);
            self
        }

        pub fn exit(mut self, pid: Pid, code: i32) -> Self {
            self.stops.push_back(Ok(WaitStatus::Exited(pid, code)));
            self
        }

        pub fn resumes(&self) -> Vec<Option<Signal>> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Syscall(sig) => Some(*sig),
                    _ => None,
                })
                .collect()
        }
    }

    pub fn siginfo(sig: Signal) -> libc::siginfo_t {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = sig as i32;
        info
    }

    impl Kernel for Script {
        fn syscall(&mut self, _pid: Pid, sig: Option<Signal>) -> Result<(), Errno> {
            self.calls.push(Call::Syscall(sig));
            match self.resume_errors.pop_front() {
                Some(errno) => Err(errno),
                None => Ok(()),
            }
        }

        fn wait(&mut self, _pid: Pid) -> Result<WaitStatus, Errno> {
            self.calls.push(Call::Wait);
            self.stops.pop_front().unwrap_or(Err(Errno::ECHILD))
        }

        fn registers(&mut self, _pid: Pid) -> Result<Registers, Errno> {
            self.calls.push(Call::Registers);
            self.regs.pop_front().unwrap_or(Err(Errno::ESRCH))
        }

        fn siginfo(&mut self, _pid: Pid) -> Result<libc::siginfo_t, Errno> {
            self.calls.push(Call::Siginfo);
            self.siginfo.pop_front().unwrap_or(Err(Errno::ESRCH))
        }
    }
}
