use nix::{errno::Errno, unistd::Pid};
use thiserror::Error;

/// Anything that can end a tracing session early.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not start {command}: {source}")]
    Start {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not attach to process with pid {pid} - check your permissions")]
    Permission { pid: Pid },

    #[error("could not attach to process with pid {pid}: {source}")]
    Attach { pid: Pid, source: Errno },

    #[error("tracer for {pid} used from a thread other than the one that created it")]
    WrongThread { pid: Pid },

    #[error("could not set trace options on {pid}: {source}")]
    Options { pid: Pid, source: Errno },

    #[error("could not install signal listener: {0}")]
    Listener(Errno),

    #[error("could not intercept syscall of {pid}: {source}")]
    Resume { pid: Pid, source: Errno },

    #[error("wait for {pid} failed: {source}")]
    Wait { pid: Pid, source: Errno },

    #[error("failed to read registers of {pid}: {source}")]
    Registers { pid: Pid, source: Errno },

    #[error("failed to read signal info of {pid}: {source}")]
    SignalInfo { pid: Pid, source: Errno },

    #[error("{pid}: expecting syscall but received -1, did we miss a signal?")]
    Protocol { pid: Pid },

    #[error("{pid}: syscall exit mismatch: {exit} != {enter}, an unprocessed signal desynchronized the tracer")]
    PairingMismatch { pid: Pid, enter: i64, exit: i64 },

    #[error("{pid}: decoding syscall {nr} failed: {source}")]
    Decode {
        pid: Pid,
        nr: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
