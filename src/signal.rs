use std::sync::atomic::{AtomicI32, Ordering};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::Pid,
};

use crate::{
    error::{Error, Result},
    kernel::Kernel,
};

/// A signal-delivery stop, as reported to the signal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigInfo {
    pub pid: Pid,
    pub signal: Signal,
    /// `si_code` of the pending signal.
    pub code: i32,
    /// Sending process, for signals sent with `kill(2)` and friends.
    pub sender: Option<Pid>,
}

impl SigInfo {
    pub(crate) fn new(pid: Pid, signal: Signal, raw: &libc::siginfo_t) -> Self {
        // si_pid is only filled in for signals raised from userspace
        let sender = (raw.si_code <= 0)
            .then(|| Pid::from_raw(unsafe { raw.si_pid() }))
            .filter(|pid| pid.as_raw() > 0);
        Self {
            pid,
            signal,
            code: raw.si_code,
            sender,
        }
    }
}

/// Signals that suspend a process until it is sent `SIGCONT`.
pub fn is_job_control_stop(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}

/// What the relay did with a signal-delivery stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Stopped,
    // already resumed, the next iteration must only wait
    Resumed,
}

/// Decides which signals reach the tracee.
///
/// Job-control stops are held back and delivered with the next resume, so
/// the tracee stops for real only once the tracer lets it run again. Other
/// signals are not delivered.
#[derive(Debug, Default)]
pub struct Relay {
    pending: Option<Signal>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<Signal> {
        self.pending
    }

    /// Handle a stop for `sig` that was not a syscall-stop.
    pub fn stopped<K: Kernel>(
        &mut self,
        kernel: &mut K,
        pid: Pid,
        sig: Signal,
        terminating: bool,
    ) -> Result<Outcome> {
        if is_job_control_stop(sig) {
            if terminating {
                debug!("[{}] {} while terminating, not remembered", pid, sig);
                return Ok(Outcome::Stopped);
            }
            debug!("[{}] remembering {} for next resume", pid, sig);
            self.pending = Some(sig);
            return Ok(Outcome::Stopped);
        }

        let Some(pending) = self.pending else {
            return Ok(Outcome::Stopped);
        };

        if sig == Signal::SIGCONT {
            debug!("[{}] {} cancels pending {}", pid, sig, pending);
            self.pending = None;
            return Ok(Outcome::Stopped);
        }

        debug!("[{}] absorbing {}, resuming with {}", pid, sig, pending);
        match kernel.syscall(pid, Some(pending)) {
            Ok(()) => Ok(Outcome::Resumed),
            Err(Errno::ESRCH) => {
                debug!("[{}] gone before it could be resumed", pid);
                Ok(Outcome::Resumed)
            }
            Err(source) => Err(Error::Resume { pid, source }),
        }
    }
}

/// Signals that end a tracing session.
pub const TERMINATING: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
];

/// Last terminating signal delivered to this process, 0 for none.
static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record(signal: libc::c_int) {
    RECEIVED.store(signal, Ordering::Relaxed);
}

/// Records terminating signals in a flag the trace loop polls.
///
/// The previous dispositions are restored on drop.
pub struct Listener {
    previous: Vec<(Signal, SigAction)>,
}

impl Listener {
    pub fn install() -> Result<Self> {
        RECEIVED.store(0, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(record),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut listener = Self {
            previous: Vec::with_capacity(TERMINATING.len()),
        };
        for sig in TERMINATING {
            // SAFETY: `record` only stores to an atomic.
            let previous = unsafe { signal::sigaction(sig, &action) }.map_err(Error::Listener)?;
            listener.previous.push((sig, previous));
        }
        info!("listening for {:?}", TERMINATING);
        Ok(listener)
    }

    pub fn flag(&self) -> &'static AtomicI32 {
        &RECEIVED
    }

    pub fn received(&self) -> Option<Signal> {
        Signal::try_from(RECEIVED.load(Ordering::Relaxed)).ok()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for (sig, previous) in self.previous.drain(..) {
            // SAFETY: restores a disposition that was installed before ours.
            if let Err(e) = unsafe { signal::sigaction(sig, &previous) } {
                warn!("could not restore handler for {}: {}", sig, e);
            }
        }
    }
}
