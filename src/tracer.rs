use std::{
    sync::atomic::{AtomicI32, Ordering},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use nix::{
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};
use syscalls::Sysno;

use crate::{
    error::{Error, Result},
    kernel::Kernel,
    pairing::Pairing,
    signal::{Outcome, Relay, SigInfo},
    syscall::{Decoder, Syscall},
};

/// Pause before dispatching the enter half of a `read`, modelling baseline
/// I/O latency.
pub const READ_LATENCY: Duration = Duration::from_millis(50);

/// Callbacks invoked from the trace loop, on the tracing thread.
///
/// A handler that blocks stalls the tracee along with it.
#[derive(Default)]
pub struct Handlers {
    pub(crate) syscall_enter: Option<Box<dyn FnMut(&Syscall)>>,
    pub(crate) syscall_exit: Option<Box<dyn FnMut(&Syscall)>>,
    pub(crate) signal: Option<Box<dyn FnMut(&SigInfo)>>,
    pub(crate) process_exit: Option<Box<dyn FnMut(i32)>>,
    pub(crate) attach: Option<Box<dyn FnMut(Pid)>>,
    pub(crate) detach: Option<Box<dyn FnMut(Pid)>>,
}

impl Handlers {
    pub(crate) fn attached(&mut self, pid: Pid) {
        if let Some(handler) = self.attach.as_mut() {
            handler(pid);
        }
    }

    pub(crate) fn detached(&mut self, pid: Pid) {
        if let Some(handler) = self.detach.as_mut() {
            handler(pid);
        }
    }
}

/// How a trace loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum End {
    /// The tracee exited with this code.
    Exited(i32),
    /// A terminating signal reached the tracer.
    Interrupted(Signal),
}

/// Drives a stopped tracee from syscall-stop to syscall-stop.
pub struct TraceLoop<'a, K: Kernel> {
    pid: Pid,
    kernel: K,
    decoder: &'a mut dyn Decoder,
    handlers: &'a mut Handlers,
    terminating: &'a AtomicI32,
    pairing: Pairing,
    relay: Relay,
    resumed: bool,
}

impl<'a, K: Kernel> TraceLoop<'a, K> {
    pub fn new(
        pid: Pid,
        kernel: K,
        decoder: &'a mut dyn Decoder,
        handlers: &'a mut Handlers,
        terminating: &'a AtomicI32,
    ) -> Self {
        Self {
            pid,
            kernel,
            decoder,
            handlers,
            terminating,
            pairing: Pairing::new(),
            relay: Relay::new(),
            resumed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn kernel(&self) -> &K {
        &self.kernel
    }

    fn terminating(&self) -> Option<Signal> {
        Signal::try_from(self.terminating.load(Ordering::Relaxed)).ok()
    }

    /// Trace until the tracee exits or a terminating signal arrives.
    pub fn run(&mut self) -> Result<End> {
        loop {
            if let Some(code) = self.step()? {
                return Ok(End::Exited(code));
            }
            if let Some(sig) = self.terminating() {
                info!("[{}] {} received, stopping trace", self.pid, sig);
                return Ok(End::Interrupted(sig));
            }
        }
    }

    /// Resume the tracee, wait for its next stop and dispatch it.
    ///
    /// Returns the exit code once the tracee is gone.
    fn step(&mut self) -> Result<Option<i32>> {
        let pid = self.pid;

        if !std::mem::take(&mut self.resumed) {
            let sig = self.relay.pending();
            self.kernel
                .syscall(pid, sig)
                .map_err(|source| Error::Resume { pid, source })?;
        }

        let status = self
            .kernel
            .wait(pid)
            .map_err(|source| Error::Wait { pid, source })?;

        match status {
            WaitStatus::PtraceEvent(_, _, event) => {
                debug!("[{}] ptrace event {}, resuming", pid, event);
                Ok(None)
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                debug!("[{}] plain SIGTRAP, resuming", pid);
                Ok(None)
            }
            WaitStatus::Exited(_, code) => Ok(Some(self.exited(code))),
            WaitStatus::Signaled(_, sig, core_dumped) => {
                info!("[{}] killed by {}, core dumped? {}", pid, sig, core_dumped);
                Ok(Some(self.exited(128 + sig as i32)))
            }
            WaitStatus::Stopped(_, sig) => self.signal(sig).map(|_| None),
            WaitStatus::PtraceSyscall(_) => self.syscall().map(|_| None),
            status => {
                warn!("[{}] received unhandled wait status: {:?}", pid, status);
                Ok(None)
            }
        }
    }

    fn exited(&mut self, code: i32) -> i32 {
        info!("[{}] exited with status {}", self.pid, code);
        if let Some(handler) = self.handlers.process_exit.as_mut() {
            handler(code);
        }
        code
    }

    fn signal(&mut self, sig: Signal) -> Result<()> {
        let pid = self.pid;
        debug!("[{}] stopped with {}", pid, sig);

        let raw = self
            .kernel
            .siginfo(pid)
            .map_err(|source| Error::SignalInfo { pid, source })?;
        if let Some(handler) = self.handlers.signal.as_mut() {
            handler(&SigInfo::new(pid, sig, &raw));
        }

        let terminating = self.terminating().is_some();
        if self.relay.stopped(&mut self.kernel, pid, sig, terminating)? == Outcome::Resumed {
            self.resumed = true;
        }
        Ok(())
    }

    fn syscall(&mut self) -> Result<()> {
        let pid = self.pid;
        let regs = self
            .kernel
            .registers(pid)
            .map_err(|source| Error::Registers { pid, source })?;
        if regs.nr == -1 {
            return Err(Error::Protocol { pid });
        }

        let exit = self.pairing.is_exit();
        let mut call = Syscall::new(pid, regs, exit);
        self.pairing.pair(&mut call)?;
        self.decoder
            .decode(&mut call, exit)
            .map_err(|source| Error::Decode {
                pid,
                nr: call.number(),
                source,
            })?;

        if exit {
            if let Some(handler) = self.handlers.syscall_exit.as_mut() {
                handler(&call);
            }
        } else if let Some(handler) = self.handlers.syscall_enter.as_mut() {
            if call.sysno() == Some(Sysno::read) {
                thread::sleep(READ_LATENCY);
            }
            handler(&call);
        }

        self.pairing.advance(call);
        Ok(())
    }
}
