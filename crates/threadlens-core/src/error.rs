use crate::platform::Tid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Enumeration error: {0}")]
    Enumeration(String),

    #[error("Failed to acquire thread {tid}: {reason}")]
    Acquire { tid: Tid, reason: String },

    #[error("Platform error: {0}")]
    Platform(String),

    /// At least one frozen thread could not be confirmed running again.
    #[error("Resume incomplete: {failed} of {suspended} suspended threads were not confirmed resumed")]
    ResumeIncomplete { failed: usize, suspended: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<procfs::ProcError> for Error {
    fn from(err: procfs::ProcError) -> Self {
        Error::Enumeration(err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Platform(err.to_string())
    }
}
