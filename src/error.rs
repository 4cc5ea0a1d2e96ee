//! Error taxonomy shared by the session layer, the transfer engine and the orchestrator.
//!
//! Each variant keeps the underlying cause text so an operator can act on a
//! failure without knowing how the engine works internally.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::models::Digest;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or host level failure. The user may simply re-run the operation.
    #[error("{endpoint} is unreachable: {cause}")]
    Unreachable { endpoint: String, cause: String },

    /// Credential or identity problem. Never retried automatically.
    #[error("authentication to {endpoint} failed: {cause}")]
    Authentication { endpoint: String, cause: String },

    #[error("`{command}` did not finish within {}s", after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("integrity check failed for {}: expected {expected}, found {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: Digest,
        actual: String,
    },

    /// The caller asked for something unsafe. Never auto-resolved.
    #[error("refusing to continue: {0}")]
    Precondition(String),

    #[error("giving up on {} after {attempts} attempt(s): {cause}", path.display())]
    ExhaustedRetries {
        path: PathBuf,
        attempts: u32,
        cause: String,
    },

    /// A remote procedure exited with a non-zero status; `stderr` is the cause.
    #[error("`{procedure}` exited with status {status}: {stderr}")]
    RemoteProcedure {
        procedure: String,
        status: i32,
        stderr: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backup index error: {0}")]
    Index(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether re-running the same request has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unreachable { .. } | Error::Timeout { .. } => true,
            Error::Io(e) => is_transient_io_error(e),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(io::Error::other(format!("background task failed: {err}")))
    }
}

/// Check if an I/O error looks like a dropped or stalled transport rather than
/// a problem with the file itself.
pub fn is_transient_io_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::TimedOut
        | ErrorKind::UnexpectedEof
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => true,
        ErrorKind::NotFound | ErrorKind::PermissionDenied => false,
        _ => matches!(
            error.raw_os_error(),
            Some(
                libc::ECONNRESET
                    | libc::ETIMEDOUT
                    | libc::EPIPE
                    | libc::ENETUNREACH
                    | libc::ENETDOWN
                    | libc::EHOSTUNREACH
            )
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_is_transient() {
        let error = io::Error::new(ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_transient_io_error(&error));
        assert!(Error::Io(error).is_transient());
    }

    #[test]
    fn raw_network_errno_is_transient() {
        let error = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert!(is_transient_io_error(&error));
    }

    #[test]
    fn missing_file_is_not_transient() {
        let error = io::Error::new(ErrorKind::NotFound, "gone");
        assert!(!is_transient_io_error(&error));
    }

    #[test]
    fn precondition_is_never_transient() {
        assert!(!Error::Precondition("no database".into()).is_transient());
        assert!(
            !Error::Authentication {
                endpoint: "deploy@db1:22".into(),
                cause: "denied".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn procedure_failure_carries_stderr() {
        let err = Error::RemoteProcedure {
            procedure: "restore-backup".into(),
            status: 1,
            stderr: "Access denied for user 'root'".into(),
        };
        assert!(err.to_string().contains("Access denied"));
    }
}
