use std::{fmt, path::PathBuf};

use log::debug;
use nix::{sys::ptrace, unistd::Pid};
use syscalls::Sysno;

use crate::regs::Registers;

/// Error type decoders hand back to the tracer.
pub type DecodeError = Box<dyn std::error::Error + Send + Sync>;

/// One syscall-stop, either the enter or the exit half of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Syscall {
    pub pid: Pid,
    pub regs: Registers,
    /// Human readable arguments, filled in by a [`Decoder`].
    pub args: Vec<String>,
    /// Filesystem paths the call touches, filled in by a [`Decoder`].
    pub paths: Vec<PathBuf>,
    exit: bool,
}

impl Syscall {
    pub fn new(pid: Pid, regs: Registers, exit: bool) -> Self {
        Self {
            pid,
            regs,
            args: Vec::new(),
            paths: Vec::new(),
            exit,
        }
    }

    pub fn number(&self) -> i64 {
        self.regs.nr
    }

    pub fn sysno(&self) -> Option<Sysno> {
        usize::try_from(self.regs.nr).ok().and_then(Sysno::new)
    }

    pub fn name(&self) -> &'static str {
        self.sysno().map_or("unknown", |sysno| sysno.name())
    }

    pub fn is_exit(&self) -> bool {
        self.exit
    }

    /// Return value, only meaningful on the exit half.
    pub fn ret(&self) -> i64 {
        self.regs.ret
    }

    /// Take the resolved fields of the matching enter event.
    pub(crate) fn reuse(&mut self, enter: &Syscall) {
        self.args.clone_from(&enter.args);
        self.paths.clone_from(&enter.paths);
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}(", self.pid, self.name())?;
        if self.args.is_empty() {
            let raw = &self.regs.args[..3];
            write!(f, "{:#x}, {:#x}, {:#x}", raw[0], raw[1], raw[2])?;
        } else {
            write!(f, "{}", self.args.join(", "))?;
        }
        write!(f, ")")?;
        if self.exit {
            write!(f, " = {}", self.ret())?;
        }
        Ok(())
    }
}

/// Resolves raw argument registers into readable fields.
///
/// Called once per syscall-stop. On the exit half of a paired call the event
/// already carries the enter half's fields, since exit-time registers no
/// longer hold the original arguments for many syscalls.
pub trait Decoder {
    fn decode(&mut self, call: &mut Syscall, exit: bool) -> Result<(), DecodeError>;
}

/// Leaves events with their raw registers only.
impl Decoder for () {
    fn decode(&mut self, _call: &mut Syscall, _exit: bool) -> Result<(), DecodeError> {
        Ok(())
    }
}

// where a syscall keeps its fd or path argument, and its arity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Fd(usize),
    Path(usize),
    // dirfd, then path
    At(usize),
}

fn shape(sysno: Sysno) -> Option<Shape> {
    let shape = match sysno {
        Sysno::close | Sysno::fsync | Sysno::fdatasync | Sysno::fchdir => Shape::Fd(1),
        Sysno::fstat | Sysno::ftruncate | Sysno::flock | Sysno::fchmod => Shape::Fd(2),
        Sysno::read
        | Sysno::write
        | Sysno::pread64
        | Sysno::pwrite64
        | Sysno::readv
        | Sysno::writev
        | Sysno::lseek
        | Sysno::getdents64
        | Sysno::ioctl
        | Sysno::fcntl
        | Sysno::fchown => Shape::Fd(3),
        Sysno::chdir | Sysno::rmdir | Sysno::unlink => Shape::Path(1),
        Sysno::stat
        | Sysno::lstat
        | Sysno::access
        | Sysno::mkdir
        | Sysno::creat
        | Sysno::chmod
        | Sysno::truncate => Shape::Path(2),
        Sysno::open | Sysno::execve | Sysno::readlink | Sysno::chown => Shape::Path(3),
        Sysno::unlinkat | Sysno::mkdirat => Shape::At(3),
        Sysno::openat
        | Sysno::newfstatat
        | Sysno::faccessat
        | Sysno::readlinkat
        | Sysno::fchmodat => Shape::At(4),
        _ => return None,
    };
    Some(shape)
}

/// Decoder backed by `/proc` and the tracee's memory.
///
/// On enter it resolves fd arguments through `/proc/<pid>/fd/<n>` and reads
/// NUL-terminated path arguments out of the tracee. The exit half keeps what
/// enter resolved.
#[derive(Debug, Default)]
pub struct ProcDecoder;

/// Upper bound on bytes read for a single path argument.
const PATH_LIMIT: usize = libc::PATH_MAX as usize;

impl ProcDecoder {
    fn fd(pid: Pid, fd: u64, paths: &mut Vec<PathBuf>) -> String {
        let fd = fd as i32;
        // now find the file name in /proc/[pid]/[fd]
        match std::fs::read_link(format!("/proc/{}/fd/{}", pid, fd)) {
            Ok(path) => {
                let arg = format!("{}<{}>", fd, path.display());
                paths.push(path);
                arg
            }
            Err(_) => fd.to_string(),
        }
    }

    fn path(pid: Pid, addr: u64, paths: &mut Vec<PathBuf>) -> String {
        if addr == 0 {
            return "NULL".to_string();
        }
        match read_cstring(pid, addr) {
            Some(path) => {
                let arg = format!("{:?}", path);
                paths.push(PathBuf::from(path));
                arg
            }
            None => format!("{:#x}", addr),
        }
    }
}

impl Decoder for ProcDecoder {
    fn decode(&mut self, call: &mut Syscall, exit: bool) -> Result<(), DecodeError> {
        if exit && !call.args.is_empty() {
            return Ok(());
        }
        let Some(shape) = call.sysno().and_then(shape) else {
            return Ok(());
        };

        let raw = call.regs.args;
        let (resolved, arity) = match shape {
            Shape::Fd(arity) => (vec![Self::fd(call.pid, raw[0], &mut call.paths)], arity),
            Shape::Path(arity) => (vec![Self::path(call.pid, raw[0], &mut call.paths)], arity),
            Shape::At(arity) => {
                let dirfd = if raw[0] as i32 == libc::AT_FDCWD {
                    "AT_FDCWD".to_string()
                } else {
                    (raw[0] as i32).to_string()
                };
                (vec![dirfd, Self::path(call.pid, raw[1], &mut call.paths)], arity)
            }
        };

        let rest = raw[resolved.len()..arity].iter().map(|arg| format!("{:#x}", arg));
        call.args = resolved.into_iter().chain(rest).collect();
        debug!("decoded {}", call);
        Ok(())
    }
}

fn read_cstring(pid: Pid, addr: u64) -> Option<String> {
    let mut bytes = Vec::new();
    let mut current_addr = addr as usize;

    while bytes.len() < PATH_LIMIT {
        let word = ptrace::read(pid, current_addr as ptrace::AddressType).ok()?;
        for byte in word.to_ne_bytes() {
            if byte == 0 {
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
        }
        current_addr += std::mem::size_of::<libc::c_long>();
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
