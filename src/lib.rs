//! Intercept every syscall a process makes, and optionally slow some of
//! them down.
//!
//! A [`Tracer`] either attaches to a running process or spawns one, then
//! stops it at every syscall entry and exit and hands each stop to the
//! registered handlers. Handlers can call [`Tamper::delay`] to hold up
//! syscalls matching a rule, to see how software copes with slow I/O.
//!
//! ```no_run
//! use syscall_tamper::{SyscallNames, Tamper, Tracer};
//!
//! let mut tamper = Tamper::new(SyscallNames);
//! tamper.parse("read").unwrap();
//!
//! let mut tracer = Tracer::spawn("cat", &["/etc/hostname"], false).unwrap();
//! tracer
//!     .on_syscall_enter(move |call| tamper.delay(call))
//!     .on_syscall_exit(|call| println!("{}", call));
//! tracer.start().unwrap();
//! ```
//!
//! Linux on x86_64 only.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("syscall-tamper needs ptrace on x86_64 Linux");

pub mod error;
pub mod kernel;
pub mod pairing;
pub mod process;
pub mod regs;
pub mod signal;
pub mod syscall;
pub mod tamper;
pub mod tracer;

pub use error::{Error, Result};
pub use process::Tracer;
pub use regs::Registers;
pub use signal::SigInfo;
pub use syscall::{Decoder, ProcDecoder, Syscall};
pub use tamper::{Filter, FilterParser, ParseError, SyscallNames, Tamper};
pub use tracer::End;
