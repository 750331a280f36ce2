//! The lock protocol: acquire, verify submissions, release.
//!
//! ```text
//! Unlocked -> Locking -> Locked <-> Verifying -> Unlocked
//! ```
//!
//! [`LockManager::acquire`] checks preconditions, restricts the socket and
//! writes the ledger. The returned [`LockEpisode`] owns everything that must
//! be undone; it is released by a correct submission, by
//! [`LockEpisode::abort`], or when dropped.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LockContext;
use crate::credential::CredentialStore;
use crate::error::{ConfigurationError, EnvironmentError, LockError};
use crate::input::{EntryAction, Glyph, SecureBuffer};
use crate::ledger::{Ledger, LockState};
use crate::socket::{self, SocketSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Unlocked,
    Locking,
    Locked,
    Verifying,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockPhase::Unlocked => "unlocked",
            LockPhase::Locking => "locking",
            LockPhase::Locked => "locked",
            LockPhase::Verifying => "verifying",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Restrict the tmux socket so no new client can attach
    pub socket_protect: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            socket_protect: true,
        }
    }
}

/// Result of submitting the entry buffer.
#[derive(Debug)]
pub enum UnlockOutcome {
    /// Wrong password, or verification failed. Still locked.
    Rejected,
    /// Unlocked. Any step of the release that failed is reported here.
    Unlocked { release_errors: Vec<LockError> },
}

impl UnlockOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, UnlockOutcome::Unlocked { .. })
    }
}

/// Snapshot of the lock for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub password_configured: bool,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_for_secs: Option<u64>,
    pub socket_path: Option<String>,
    pub pid: Option<u32>,
}

/// What [`LockManager::recover`] did with the ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// No record present
    NothingToRecover,
    /// The locking process is still running
    Held { pid: u32 },
    /// The record belongs to a different tmux server
    OtherSocket { socket_path: String },
    /// Stale record removed, socket permissions restored if it still exists
    Recovered {
        socket_path: Option<String>,
        socket_restored: bool,
    },
}

/// Entry point for everything the CLI does with the lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    context: LockContext,
    credentials: CredentialStore,
    ledger: Ledger,
}

impl LockManager {
    pub fn new(context: LockContext) -> Self {
        let credentials = CredentialStore::new(&context.paths.credential_file);
        let ledger = Ledger::new(&context.paths.state_file);
        Self {
            context,
            credentials,
            ledger,
        }
    }

    pub fn context(&self) -> &LockContext {
        &self.context
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Socket path named by the current environment.
    pub fn socket_path(&self) -> Result<PathBuf, EnvironmentError> {
        socket::socket_path(self.context.socket_descriptor.as_deref())
    }

    /// Lock the session.
    ///
    /// Fails without touching the socket or the ledger when no password is
    /// configured, or when protection is requested outside tmux. If writing
    /// the ledger fails after the socket was restricted, the socket is
    /// restored before the error is returned.
    pub fn acquire(&self, options: LockOptions) -> Result<LockEpisode, LockError> {
        self.acquire_with(options, |ledger, socket| ledger.acquire(socket))
    }

    /// [`acquire`](Self::acquire) with the ledger write supplied by the caller.
    fn acquire_with<F>(&self, options: LockOptions, record: F) -> Result<LockEpisode, LockError>
    where
        F: FnOnce(&Ledger, Option<(&Path, u32)>) -> Result<LockState, LockError>,
    {
        if !self.credentials.exists() {
            return Err(ConfigurationError::NoPassword.into());
        }
        let socket_path = if options.socket_protect {
            Some(self.socket_path()?)
        } else {
            None
        };

        // A second lock would record the already restricted mode as the original
        if let Ok(Some(state)) = self.ledger.load() {
            if state.locked && process_alive(state.pid) {
                return Err(LockError::AlreadyLocked(state.pid));
            }
        }

        log::debug!("Lock phase: {}", LockPhase::Locking);
        let snapshot = match &socket_path {
            Some(path) => Some(socket::restrict(path)?),
            None => None,
        };

        let recorded = snapshot.as_ref().map(|s| (s.path.as_path(), s.mode));
        if let Err(e) = record(&self.ledger, recorded) {
            log::error!("Failed to record lock state: {}", e);
            let mut unwind = Vec::new();
            if let Some(snapshot) = &snapshot {
                if let Err(restore_err) = snapshot.restore() {
                    log::error!(
                        "Failed to restore {} after lock failure: {}",
                        snapshot.path.display(),
                        restore_err
                    );
                    unwind.push(restore_err);
                }
            }
            return Err(LockError::aggregate(e, unwind));
        }

        log::info!(
            "Session locked{}",
            socket_path
                .map(|p| format!(" (socket {} restricted)", p.display()))
                .unwrap_or_default()
        );
        Ok(LockEpisode {
            credentials: self.credentials.clone(),
            ledger: self.ledger.clone(),
            buffer: SecureBuffer::new(),
            socket: snapshot,
            phase: LockPhase::Locked,
            failed_attempts: 0,
        })
    }

    pub fn status(&self) -> Result<LockStatus, LockError> {
        let password_configured = self.credentials.exists();
        let state = match self.ledger.load() {
            Ok(state) => state.filter(|s| s.locked),
            Err(LockError::CorruptState(e)) => {
                log::warn!(
                    "Ignoring unreadable lock state {}: {}",
                    self.ledger.path().display(),
                    e
                );
                None
            }
            Err(e) => return Err(e),
        };

        Ok(match state {
            Some(state) => LockStatus {
                password_configured,
                locked: true,
                locked_at: Some(state.locked_at),
                locked_for_secs: Some(state.elapsed().as_secs()),
                socket_path: state.socket().map(|p| p.display().to_string()),
                pid: Some(state.pid).filter(|&pid| pid != 0),
            },
            None => LockStatus {
                password_configured,
                locked: false,
                locked_at: None,
                locked_for_secs: None,
                socket_path: None,
                pid: None,
            },
        })
    }

    /// Undo a lock left behind by a process that no longer exists.
    ///
    /// Only records for the current tmux server (or without a socket) are
    /// touched. The socket is restored before the record is deleted.
    pub fn recover(&self) -> Result<RecoveryOutcome, LockError> {
        let Some(state) = self.ledger.load()? else {
            return Ok(RecoveryOutcome::NothingToRecover);
        };

        if process_alive(state.pid) {
            log::debug!("Lock held by running process {}", state.pid);
            return Ok(RecoveryOutcome::Held { pid: state.pid });
        }

        let recorded = state.socket().map(Path::to_path_buf);
        if let Some(recorded) = &recorded {
            let current = self.socket_path().ok();
            if current.as_deref() != Some(recorded.as_path()) {
                log::debug!(
                    "Lock record for {} does not match this tmux server",
                    recorded.display()
                );
                return Ok(RecoveryOutcome::OtherSocket {
                    socket_path: state.socket_path,
                });
            }
        }

        let mut socket_restored = false;
        if let Some(recorded) = &recorded {
            match socket::restore(recorded, state.socket_permission) {
                Ok(()) => socket_restored = true,
                Err(LockError::Storage { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    log::info!("Socket {} is gone, nothing to restore", recorded.display());
                }
                Err(e) => return Err(e),
            }
        }
        self.ledger.release()?;

        log::warn!(
            "Recovered stale lock from process {} (locked at {})",
            state.pid,
            state.locked_at
        );
        Ok(RecoveryOutcome::Recovered {
            socket_path: recorded.map(|p| p.display().to_string()),
            socket_restored,
        })
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// One locked period, from acquire to release.
///
/// Dropping an episode that has not been unlocked releases it, so the socket
/// is restored on every exit path that unwinds.
pub struct LockEpisode {
    credentials: CredentialStore,
    ledger: Ledger,
    buffer: SecureBuffer,
    socket: Option<SocketSnapshot>,
    phase: LockPhase,
    failed_attempts: u32,
}

impl LockEpisode {
    pub fn phase(&self) -> LockPhase {
        self.phase
    }

    pub fn is_locked(&self) -> bool {
        self.phase != LockPhase::Unlocked
    }

    /// The restricted socket and its original permissions.
    pub fn socket(&self) -> Option<&SocketSnapshot> {
        self.socket.as_ref()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn buffer(&self) -> &SecureBuffer {
        &self.buffer
    }

    pub fn glyphs(&self) -> Vec<Glyph> {
        self.buffer.glyphs()
    }

    /// Feed one keystroke action. Returns an outcome only for submissions.
    pub fn handle(&mut self, action: EntryAction) -> Option<UnlockOutcome> {
        if self.phase != LockPhase::Locked {
            return None;
        }
        match action {
            EntryAction::Key(key) => {
                self.buffer.push(key);
            }
            EntryAction::Backspace => {
                self.buffer.backspace();
            }
            EntryAction::Cancel | EntryAction::Interrupt => {
                self.buffer.clear();
            }
            EntryAction::Submit => return Some(self.submit()),
        }
        None
    }

    /// Verify what has been typed.
    ///
    /// The buffer is cleared either way. Verification errors count as a
    /// wrong password so the session stays locked.
    pub fn submit(&mut self) -> UnlockOutcome {
        match self.phase {
            LockPhase::Unlocked => {
                return UnlockOutcome::Unlocked {
                    release_errors: Vec::new(),
                }
            }
            LockPhase::Locked => {}
            LockPhase::Locking | LockPhase::Verifying => return UnlockOutcome::Rejected,
        }

        self.phase = LockPhase::Verifying;
        let verified = {
            let attempt = self.buffer.snapshot();
            self.buffer.clear();
            self.credentials.check(attempt.as_bytes())
        };

        match verified {
            Ok(true) => {
                log::info!(
                    "Password accepted after {} failed attempt(s)",
                    self.failed_attempts
                );
                let release_errors = self.release();
                UnlockOutcome::Unlocked { release_errors }
            }
            Ok(false) => {
                self.failed_attempts += 1;
                log::info!("Password rejected (attempt {})", self.failed_attempts);
                self.phase = LockPhase::Locked;
                UnlockOutcome::Rejected
            }
            Err(e) => {
                self.failed_attempts += 1;
                log::error!("Password verification failed: {}", e);
                self.phase = LockPhase::Locked;
                UnlockOutcome::Rejected
            }
        }
    }

    /// End the episode without a password, e.g. on SIGTERM.
    pub fn abort(mut self) -> Result<(), LockError> {
        log::warn!("Lock aborted in phase {}", self.phase);
        let mut errors = self.release();
        if errors.is_empty() {
            Ok(())
        } else {
            let cause = errors.remove(0);
            Err(LockError::aggregate(cause, errors))
        }
    }

    /// Restore the socket, then delete the ledger record.
    fn release(&mut self) -> Vec<LockError> {
        let mut errors = Vec::new();
        self.buffer.clear();

        if let Some(snapshot) = self.socket.take() {
            if let Err(e) = snapshot.restore() {
                log::error!(
                    "Failed to restore socket {}: {}",
                    snapshot.path.display(),
                    e
                );
                errors.push(e);
            }
        }
        if let Err(e) = self.ledger.release() {
            log::error!("Failed to clear lock state: {}", e);
            errors.push(e);
        }

        self.phase = LockPhase::Unlocked;
        log::info!("Session unlocked");
        errors
    }
}

impl Drop for LockEpisode {
    fn drop(&mut self) {
        if self.phase != LockPhase::Unlocked {
            let errors = self.release();
            if !errors.is_empty() {
                log::error!("{} error(s) releasing dropped lock", errors.len());
            }
        }
        self.buffer.clear();
    }
}

impl fmt::Debug for LockEpisode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockEpisode")
            .field("phase", &self.phase)
            .field("socket", &self.socket)
            .field("failed_attempts", &self.failed_attempts)
            .field("buffer", &self.buffer)
            .finish()
    }
}
