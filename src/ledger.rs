//! The lock ledger: a small file whose presence means "locked".
//!
//! At most one record exists. Acquiring overwrites any previous record, and
//! releasing deletes it. The record also keeps the socket permissions to
//! restore, so a later invocation can undo a lock whose process died.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::write_private;
use crate::error::{EnvironmentError, LockError};

/// Contents of the lock state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub locked: bool,
    pub locked_at: DateTime<Utc>,
    /// Empty when socket protection was disabled
    #[serde(default)]
    pub socket_path: String,
    /// Zero when socket protection was disabled
    #[serde(default)]
    pub socket_permission: u32,
    /// Process holding the lock, 0 if unknown
    #[serde(default)]
    pub pid: u32,
}

impl LockState {
    /// Socket recorded for restoration, if protection was enabled.
    pub fn socket(&self) -> Option<&Path> {
        if self.socket_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.socket_path))
        }
    }

    /// How long ago the lock was taken. Clock skew reads as zero.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.locked_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that the session is locked, replacing any earlier record.
    pub fn acquire(&self, socket: Option<(&Path, u32)>) -> Result<LockState, LockError> {
        let (socket_path, socket_permission) = match socket {
            Some((path, mode)) => {
                let path = path
                    .to_str()
                    .ok_or_else(|| EnvironmentError::NonUtf8SocketPath(path.to_path_buf()))?;
                (path.to_string(), mode)
            }
            None => (String::new(), 0),
        };
        let state = LockState {
            locked: true,
            locked_at: Utc::now(),
            socket_path,
            socket_permission,
            pid: std::process::id(),
        };

        let data = serde_json::to_vec_pretty(&state).map_err(LockError::CorruptState)?;
        write_private(&self.path, &data, "lock state file")?;
        log::debug!("Wrote lock state to {}", self.path.display());
        Ok(state)
    }

    /// Delete the record. Releasing an unlocked ledger succeeds.
    pub fn release(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("Removed lock state {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::storage("removing lock state file")(e)),
        }
    }

    /// Read the record, `None` if there is none.
    pub fn load(&self) -> Result<Option<LockState>, LockError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::storage("reading lock state file")(e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(LockError::CorruptState)
    }

    /// True only for a readable record whose `locked` flag is set.
    ///
    /// Unreadable or corrupt records count as unlocked, so a damaged file can
    /// never keep the user locked out. The flip side is that corruption
    /// silently loses the locked fact; it is logged so it is not invisible.
    pub fn is_locked(&self) -> bool {
        match self.load() {
            Ok(Some(state)) => state.locked,
            Ok(None) => false,
            Err(e) => {
                log::warn!(
                    "Treating {} as unlocked: {}",
                    self.path.display(),
                    e
                );
                false
            }
        }
    }

    /// Time since the lock was taken.
    pub fn duration(&self) -> Result<Duration, LockError> {
        self.load()?
            .map(|state| state.elapsed())
            .ok_or(LockError::NotLocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn ledger(temp_dir: &TempDir) -> Ledger {
        Ledger::new(temp_dir.path().join("yule-log").join("lock.state"))
    }

    #[test]
    fn test_acquire_then_release() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);

        assert!(!ledger.is_locked());

        ledger
            .acquire(Some((Path::new("/tmp/tmux-1000/default"), 0o700)))
            .unwrap();
        assert!(ledger.is_locked());

        let state = ledger.load().unwrap().unwrap();
        assert!(state.locked);
        assert_eq!(state.socket(), Some(Path::new("/tmp/tmux-1000/default")));
        assert_eq!(state.socket_permission, 0o700);
        assert_eq!(state.pid, std::process::id());

        ledger.release().unwrap();
        assert!(!ledger.is_locked());
        assert_eq!(ledger.load().unwrap(), None);
    }

    #[test]
    fn test_release_absent_record() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);

        ledger.release().unwrap();
        ledger.release().unwrap();
    }

    #[test]
    fn test_acquire_without_socket() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);

        let state = ledger.acquire(None).unwrap();
        assert_eq!(state.socket(), None);
        assert_eq!(state.socket_permission, 0);
        assert!(ledger.is_locked());
    }

    #[test]
    fn test_acquire_twice_replaces_record() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);

        let first = ledger.acquire(None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = ledger
            .acquire(Some((Path::new("/tmp/sock"), 0o770)))
            .unwrap();

        assert!(second.locked_at > first.locked_at);
        assert_eq!(ledger.load().unwrap(), Some(second));

        // A single release clears it
        ledger.release().unwrap();
        assert!(!ledger.is_locked());
    }

    #[test]
    fn test_record_format() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);
        ledger
            .acquire(Some((Path::new("/tmp/sock"), 0o700)))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(ledger.path()).unwrap()).unwrap();
        assert_eq!(raw["locked"], true);
        assert_eq!(raw["socket_path"], "/tmp/sock");
        assert_eq!(raw["socket_permission"], 0o700);
        assert!(raw["locked_at"].as_str().unwrap().contains('T'));

        let mode = fs::metadata(ledger.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_acquire_refuses_non_utf8_socket_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);
        let socket = Path::new(OsStr::from_bytes(b"/tmp/tmux-\xff/default"));

        assert!(matches!(
            ledger.acquire(Some((socket, 0o700))),
            Err(LockError::Environment(EnvironmentError::NonUtf8SocketPath(_)))
        ));
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_acquire_refuses_shared_directory() {
        let temp_dir = TempDir::new().unwrap();
        let victim = temp_dir.path().join("victim.txt");
        fs::write(&victim, b"untouched").unwrap();

        let ledger = ledger(&temp_dir);
        let dir = ledger.path().parent().unwrap();
        fs::create_dir(dir).unwrap();
        fs::set_permissions(dir, fs::Permissions::from_mode(0o777)).unwrap();
        std::os::unix::fs::symlink(&victim, dir.join("lock.state.tmp")).unwrap();

        assert!(matches!(
            ledger.acquire(None),
            Err(LockError::Environment(EnvironmentError::InsecureDirectory(_)))
        ));
        assert_eq!(fs::read(&victim).unwrap(), b"untouched");
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_corrupt_record_reads_as_unlocked() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);
        fs::create_dir_all(ledger.path().parent().unwrap()).unwrap();
        fs::write(ledger.path(), b"{ not json").unwrap();

        assert!(!ledger.is_locked());
        assert!(matches!(ledger.load(), Err(LockError::CorruptState(_))));
    }

    #[test]
    fn test_unlocked_flag_reads_as_unlocked() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);
        fs::create_dir_all(ledger.path().parent().unwrap()).unwrap();
        fs::write(
            ledger.path(),
            br#"{"locked": false, "locked_at": "2024-12-05T13:28:10Z"}"#,
        )
        .unwrap();

        assert!(!ledger.is_locked());
        assert_eq!(ledger.load().unwrap().unwrap().pid, 0);
    }

    #[test]
    fn test_duration() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);

        assert!(matches!(ledger.duration(), Err(LockError::NotLocked)));

        ledger.acquire(None).unwrap();
        let elapsed = ledger.duration().unwrap();
        assert!(elapsed < Duration::from_secs(60));
    }

    #[test]
    fn test_duration_of_old_record() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger(&temp_dir);
        fs::create_dir_all(ledger.path().parent().unwrap()).unwrap();
        fs::write(
            ledger.path(),
            br#"{"locked": true, "locked_at": "2024-12-05T13:28:10Z"}"#,
        )
        .unwrap();

        assert!(ledger.duration().unwrap() > Duration::from_secs(3600));
    }
}
