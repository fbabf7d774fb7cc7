use std::{
    marker::PhantomData,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
};

use log::{info, warn};
use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, Options},
        wait::waitpid,
    },
    unistd::{gettid, Pid},
};

use crate::{
    error::{Error, Result},
    kernel::Ptrace,
    signal::{Listener, SigInfo},
    syscall::{Decoder, ProcDecoder, Syscall},
    tracer::{End, Handlers, TraceLoop},
};

// ptrace requests are only accepted from the thread that became the tracer
#[derive(Debug)]
struct Binding {
    tid: Pid,
    _not_send: PhantomData<*const ()>,
}

impl Binding {
    fn acquire() -> Self {
        Self {
            tid: gettid(),
            _not_send: PhantomData,
        }
    }

    fn check(&self, pid: Pid) -> Result<()> {
        if gettid() != self.tid {
            return Err(Error::WrongThread { pid });
        }
        Ok(())
    }
}

/// A traced process and the handlers observing it.
pub struct Tracer {
    pid: Pid,
    child: Option<Child>,
    handlers: Handlers,
    decoder: Box<dyn Decoder>,
    binding: Binding,
}

impl Tracer {
    /// Trace an already running process. Nothing happens until [`Tracer::start`].
    pub fn attach(pid: Pid) -> Self {
        Self {
            pid,
            child: None,
            handlers: Handlers::default(),
            decoder: Box::new(ProcDecoder),
            binding: Binding::acquire(),
        }
    }

    /// Start `command` so that it stops for tracing before its first
    /// instruction. stdin is inherited, stdout and stderr too unless
    /// `suppress_output` is set.
    pub fn spawn<S: AsRef<str>>(command: &str, args: &[S], suppress_output: bool) -> Result<Self> {
        let binding = Binding::acquire();

        let mut cmd = Command::new(command);
        for arg in args {
            let arg: &str = arg.as_ref();
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::inherit());
        if suppress_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        // the pid won't change with exec, so we ask to be traced
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
        }
        let child = cmd.spawn().map_err(|source| Error::Start {
            command: command.to_string(),
            source,
        })?;

        let pid = Pid::from_raw(child.id() as i32);
        info!("started {} as {}", command, pid);
        Ok(Self {
            pid,
            child: Some(child),
            handlers: Handlers::default(),
            decoder: Box::new(ProcDecoder),
            binding,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Replace the default [`ProcDecoder`].
    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn on_syscall_enter(&mut self, handler: impl FnMut(&Syscall) + 'static) -> &mut Self {
        self.handlers.syscall_enter = Some(Box::new(handler));
        self
    }

    pub fn on_syscall_exit(&mut self, handler: impl FnMut(&Syscall) + 'static) -> &mut Self {
        self.handlers.syscall_exit = Some(Box::new(handler));
        self
    }

    pub fn on_signal(&mut self, handler: impl FnMut(&SigInfo) + 'static) -> &mut Self {
        self.handlers.signal = Some(Box::new(handler));
        self
    }

    pub fn on_process_exit(&mut self, handler: impl FnMut(i32) + 'static) -> &mut Self {
        self.handlers.process_exit = Some(Box::new(handler));
        self
    }

    pub fn on_attach(&mut self, handler: impl FnMut(Pid) + 'static) -> &mut Self {
        self.handlers.attach = Some(Box::new(handler));
        self
    }

    pub fn on_detach(&mut self, handler: impl FnMut(Pid) + 'static) -> &mut Self {
        self.handlers.detach = Some(Box::new(handler));
        self
    }

    /// Trace the process until it exits or a terminating signal
    /// (`SIGINT`, `SIGHUP`, `SIGTERM`, `SIGPIPE`, `SIGQUIT`) reaches us.
    ///
    /// Must run on the thread that created the tracer. A tracer that
    /// attached detaches again on the way out, however the loop ended.
    pub fn start(&mut self) -> Result<End> {
        let pid = self.pid;
        self.binding.check(pid)?;

        if self.child.is_none() {
            ptrace::attach(pid).map_err(|source| match source {
                Errno::EPERM => Error::Permission { pid },
                source => Error::Attach { pid, source },
            })?;
        }

        // wait for the tracee to be ready
        let status = waitpid(pid, None).map_err(|source| Error::Wait { pid, source })?;
        info!("{} ready with {:?}, will ask it to continue until syscall", pid, status);
        self.handlers.attached(pid);

        let result = self.trace();

        self.handlers.detached(pid);
        if self.child.is_none() {
            release(pid);
        }
        result
    }

    fn trace(&mut self) -> Result<End> {
        let pid = self.pid;

        // deliver SIGTRAP|0x80 for syscall-stops
        let mut options = Options::PTRACE_O_TRACESYSGOOD;
        if self.child.is_some() {
            options |= Options::PTRACE_O_EXITKILL;
        }
        ptrace::setoptions(pid, options).map_err(|source| Error::Options { pid, source })?;

        let listener = Listener::install()?;
        let end = TraceLoop::new(
            pid,
            Ptrace,
            self.decoder.as_mut(),
            &mut self.handlers,
            listener.flag(),
        )
        .run()?;

        if let Some(sig) = listener.received() {
            info!("stopped tracing {} on {}", pid, sig);
        }
        Ok(end)
    }
}

/// Detach from an attached process, leaving it running.
fn release(pid: Pid) {
    match ptrace::detach(pid, None) {
        Ok(()) => info!("detached from {}", pid),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("could not detach from {}: {}", pid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_command_is_a_start_error() {
        let err = Tracer::spawn("/nonexistent/command", &["arg"], true)
            .err()
            .expect("spawn should fail");
        match err {
            Error::Start { command, .. } => assert_eq!(command, "/nonexistent/command"),
            other => panic!("expected a start error, got {}", other),
        }
    }

    #[test]
    fn start_from_another_thread_is_refused() {
        let tracer = Tracer::attach(Pid::from_raw(1));
        assert!(tracer.binding.check(tracer.pid()).is_ok());

        let tid = tracer.binding.tid;
        let other = std::thread::spawn(gettid).join().unwrap();
        assert_ne!(tid, other);

        let foreign = Binding {
            tid: other,
            _not_send: PhantomData,
        };
        assert!(matches!(
            foreign.check(Pid::from_raw(1)),
            Err(Error::WrongThread { .. })
        ));
    }
}
