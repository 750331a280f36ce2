//! Password-gated locking for tmux sessions.
//!
//! The lock is built from four leaf components and one controller:
//! - [`credential`]: Argon2id password hashing and the credential file
//! - [`input`]: the wipe-on-drop password entry buffer and key queue
//! - [`socket`]: tmux control socket permission restriction
//! - [`ledger`]: the on-disk "currently locked" record
//! - [`session`]: the acquire / verify / release protocol tying them together
//!
//! This is a casual lock. It does not rate-limit guesses, does not manage
//! more than one user's credential, and does not defend against anyone who
//! can read this process's memory or signal it.

pub mod config;
pub mod credential;
pub mod error;
pub mod input;
pub mod ledger;
pub mod session;
pub mod socket;

pub use config::{LockContext, LockPaths};
pub use error::{ConfigurationError, EnvironmentError, FormatError, LockError};
pub use session::{
    LockEpisode, LockManager, LockOptions, LockPhase, LockStatus, RecoveryOutcome, UnlockOutcome,
};
