//! tmux control socket permission guard.
//!
//! Clients attach to a tmux server through its control socket. Dropping the
//! socket's permission bits to 000 stops new clients from attaching while
//! already attached clients keep working.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{EnvironmentError, LockError};

/// Environment variable tmux sets inside its panes: `path,pid,session`.
pub const SOCKET_ENV: &str = "TMUX";

const DESCRIPTOR_SEPARATOR: char = ',';
const PERMISSION_BITS: u32 = 0o777;
const NO_ACCESS: u32 = 0o000;

/// Original permissions of a restricted socket, kept for restoration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSnapshot {
    pub path: PathBuf,
    pub mode: u32,
}

/// Extract the socket path from a `path,pid,session` descriptor.
pub fn parse_descriptor(raw: &str) -> Result<PathBuf, EnvironmentError> {
    match raw.split(DESCRIPTOR_SEPARATOR).next() {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(EnvironmentError::MalformedDescriptor(raw.to_string())),
    }
}

/// Resolve the socket path from an optional descriptor.
pub fn socket_path(descriptor: Option<&str>) -> Result<PathBuf, EnvironmentError> {
    let raw = descriptor.ok_or(EnvironmentError::MissingDescriptor)?;
    parse_descriptor(raw)
}

/// Current permission bits of `path`.
pub fn get_permission(path: &Path) -> Result<u32, LockError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.permissions().mode() & PERMISSION_BITS),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(EnvironmentError::SocketNotFound(path.to_path_buf()).into())
        }
        Err(e) => Err(LockError::storage(format!("stat socket {}", path.display()))(e)),
    }
}

/// Remove all access to the socket, returning what to restore later.
///
/// The path must be valid UTF-8 so the lock state file can record it exactly.
pub fn restrict(path: &Path) -> Result<SocketSnapshot, LockError> {
    if path.to_str().is_none() {
        return Err(EnvironmentError::NonUtf8SocketPath(path.to_path_buf()).into());
    }
    let mode = get_permission(path)?;
    set_mode(path, NO_ACCESS).map_err(LockError::storage("restricting socket permissions"))?;
    log::info!(
        "Restricted socket {} (was {:o})",
        path.display(),
        mode
    );
    Ok(SocketSnapshot {
        path: path.to_path_buf(),
        mode,
    })
}

/// Put the socket's permissions back to `mode`.
pub fn restore(path: &Path, mode: u32) -> Result<(), LockError> {
    set_mode(path, mode & PERMISSION_BITS)
        .map_err(LockError::storage("restoring socket permissions"))?;
    log::info!("Restored socket {} to {:o}", path.display(), mode);
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

impl SocketSnapshot {
    pub fn restore(&self) -> Result<(), LockError> {
        restore(&self.path, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    #[test]
    fn test_parse_descriptor() {
        let cases = [
            (
                "valid format with pid and session",
                "/tmp/tmux-501/default,12345,0",
                Ok("/tmp/tmux-501/default"),
            ),
            (
                "path with spaces",
                "/path with spaces/tmux socket,123,0",
                Ok("/path with spaces/tmux socket"),
            ),
            ("only socket path", "/tmp/tmux-socket", Ok("/tmp/tmux-socket")),
            ("trailing comma", "/tmp/tmux-socket,", Ok("/tmp/tmux-socket")),
            (
                "complex path",
                "/private/var/folders/abc123/T/tmux-501/default,98765,1",
                Ok("/private/var/folders/abc123/T/tmux-501/default"),
            ),
            ("empty descriptor", "", Err(())),
            ("just commas", ",,,", Err(())),
            ("empty path", ",123", Err(())),
        ];

        for (name, raw, want) in cases {
            let got = parse_descriptor(raw);
            match want {
                Ok(path) => assert_eq!(got, Ok(PathBuf::from(path)), "{}", name),
                Err(()) => assert_eq!(
                    got,
                    Err(EnvironmentError::MalformedDescriptor(raw.to_string())),
                    "{}",
                    name
                ),
            }
        }
    }

    #[test]
    fn test_socket_path_missing_descriptor() {
        assert_eq!(socket_path(None), Err(EnvironmentError::MissingDescriptor));
        assert_eq!(
            socket_path(Some("/tmp/tmux-1000/default,1,0")),
            Ok(PathBuf::from("/tmp/tmux-1000/default"))
        );
    }

    #[test]
    fn test_get_permission_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.sock");

        match get_permission(&missing) {
            Err(LockError::Environment(EnvironmentError::SocketNotFound(p))) => {
                assert_eq!(p, missing)
            }
            other => panic!("expected SocketNotFound, got {:?}", other),
        }
        assert!(restrict(&missing).is_err());
    }

    #[test]
    fn test_restrict_and_restore_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("default");
        let _listener = UnixListener::bind(&path).unwrap();
        set_mode(&path, 0o700).unwrap();

        let before = get_permission(&path).unwrap();
        let snapshot = restrict(&path).unwrap();

        assert_eq!(snapshot.mode, before);
        assert_eq!(get_permission(&path).unwrap(), 0);

        restore(&path, snapshot.mode).unwrap();
        assert_eq!(get_permission(&path).unwrap(), before);
    }

    #[test]
    fn test_restrict_refuses_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(OsStr::from_bytes(b"tmux-\xff"));
        fs::write(&path, b"").unwrap();
        set_mode(&path, 0o700).unwrap();

        match restrict(&path) {
            Err(LockError::Environment(EnvironmentError::NonUtf8SocketPath(p))) => {
                assert_eq!(p, path)
            }
            other => panic!("expected NonUtf8SocketPath, got {:?}", other),
        }
        assert_eq!(get_permission(&path).unwrap(), 0o700);
    }

    #[test]
    fn test_snapshot_restore() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plain-file");
        fs::write(&path, b"").unwrap();
        set_mode(&path, 0o640).unwrap();

        let snapshot = restrict(&path).unwrap();
        assert_eq!(
            snapshot,
            SocketSnapshot {
                path: path.clone(),
                mode: 0o640
            }
        );

        snapshot.restore().unwrap();
        assert_eq!(get_permission(&path).unwrap(), 0o640);
    }
}
