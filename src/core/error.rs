//! Session-level error taxonomy
//!
//! None of these are fatal: the session turns each one into a scrollback
//! line and returns to `Idle`. Invalid UTF-8 in child output is not an
//! error at all; the interpreter replaces it inline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::process::ProcessError;
use super::pty::PtyError;
use super::session::SessionId;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("could not allocate a terminal: {0}")]
    AllocationFailed(#[from] PtyError),

    #[error("{0}")]
    SpawnFailed(#[source] ProcessError),

    #[error("cd: {}: {reason}", path.display())]
    DirectoryInvalid { path: PathBuf, reason: String },

    #[error("failed to send input: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("no session with id {0}")]
    UnknownSession(SessionId),
}

impl From<ProcessError> for ShellError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Write(source) => ShellError::WriteFailed(source),
            other => ShellError::SpawnFailed(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;
