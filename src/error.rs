//! Error types shared by every lock component.

use std::io;
use std::path::PathBuf;

/// Errors raised by the lock components.
///
/// A wrong password is not an error: it is the
/// [`Rejected`](crate::session::UnlockOutcome::Rejected) outcome of a submission.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("computing password hash: {0}")]
    Verification(String),

    #[error("parsing lock state: {0}")]
    CorruptState(#[source] serde_json::Error),

    #[error("session is not locked")]
    NotLocked,

    #[error("session is already locked by process {0}")]
    AlreadyLocked(u32),

    /// A failed lock attempt whose rollback also failed.
    #[error("{cause} (restoring socket permissions also failed: {unwind})")]
    Unwind {
        cause: Box<LockError>,
        unwind: Box<LockError>,
    },
}

impl LockError {
    /// Build a closure that wraps an [`io::Error`] with context, for `map_err`.
    pub fn storage(context: impl Into<String>) -> impl FnOnce(io::Error) -> LockError {
        let context = context.into();
        move |source| LockError::Storage { context, source }
    }

    /// Combine a root cause with every error collected while undoing it.
    pub fn aggregate(cause: LockError, mut unwind: Vec<LockError>) -> LockError {
        match unwind.len() {
            0 => cause,
            1 => LockError::Unwind {
                cause: Box::new(cause),
                unwind: Box::new(unwind.remove(0)),
            },
            _ => {
                let first = unwind.remove(0);
                LockError::aggregate(
                    LockError::Unwind {
                        cause: Box::new(cause),
                        unwind: Box::new(first),
                    },
                    unwind,
                )
            }
        }
    }
}

/// The user has not set up what the lock needs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no password configured; run `yule-log lock set-password` first")]
    NoPassword,
    #[error("password cannot be empty")]
    EmptyPassword,
    #[error("passwords do not match")]
    PasswordMismatch,
}

/// The host environment does not describe a usable tmux socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("TMUX environment variable not set; not running inside tmux?")]
    MissingDescriptor,
    #[error("TMUX environment variable malformed: {0:?}")]
    MalformedDescriptor(String),
    #[error("tmux socket not found: {}", .0.display())]
    SocketNotFound(PathBuf),
    #[error("tmux socket path is not valid UTF-8: {}", .0.display())]
    NonUtf8SocketPath(PathBuf),
    #[error(
        "refusing to use {}: it must be a directory owned by the current user with mode 0700",
        .0.display()
    )]
    InsecureDirectory(PathBuf),
}

/// A stored credential that cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid password file format: expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid password file format: unsupported algorithm {0:?}")]
    Algorithm(String),
    #[error("invalid password file format: unsupported version {0:?}")]
    Version(String),
    #[error("invalid password file format: bad cost parameters {0:?}")]
    Params(String),
    #[error("decoding salt: {0}")]
    Salt(base64::DecodeError),
    #[error("decoding hash: {0}")]
    Hash(base64::DecodeError),
}
