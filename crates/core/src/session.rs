//! Remote session abstraction
//!
//! A [`Connector`] opens authenticated sessions to tags; a [`RemoteSession`]
//! runs commands and moves files over one. The SSH implementation lives in
//! `tagsync-transport`, alongside an in-process implementation for tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Credentials;

/// Why a session could not be opened
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{host} is unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{host} rejected the credentials for user {user}")]
    AuthRejected { host: String, user: String },

    #[error("protocol error talking to {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("timed out connecting to {host} after {after:?}")]
    TimedOut { host: String, after: Duration },
}

impl ConnectError {
    /// Host the failed connection was aimed at
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Unreachable { host, .. }
            | Self::AuthRejected { host, .. }
            | Self::Protocol { host, .. }
            | Self::TimedOut { host, .. } => host,
        }
    }
}

/// Failure of an operation on an open session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("remote operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("session already closed")]
    Closed,

    /// The connection itself failed, as opposed to the remote command
    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into [`SessionError::CommandFailed`]
    ///
    /// # Errors
    /// Returns an error if the command exited non-zero
    pub fn check(self, command: &str) -> Result<Self, SessionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SessionError::CommandFailed {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Opens authenticated sessions to tags
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an authenticated session to `host`
    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, ConnectError>;
}

/// An open, authenticated session to one tag.
///
/// Callers release the session with [`RemoteSession::close`] on every exit
/// path. Implementations also release their resources on drop, which covers
/// futures cancelled by a timeout.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a single shell command and capture its output
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError>;

    /// List file names in a remote directory, in listing order
    async fn list_dir(&mut self, dir: &str) -> Result<Vec<String>, SessionError>;

    /// Hex SHA-256 digest of a remote file, computed on the remote side
    async fn digest(&mut self, path: &str) -> Result<String, SessionError>;

    /// Copy a remote file to a local path, returning the number of bytes
    async fn fetch(&mut self, remote: &str, local: &Path) -> Result<u64, SessionError>;

    /// Recursively remove everything inside a remote directory
    async fn remove_contents(&mut self, dir: &str) -> Result<(), SessionError>;

    /// Close the session. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Quote a string for a POSIX shell
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
