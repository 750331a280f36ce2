//! File locations and host environment, resolved once at startup.
//!
//! Nothing below this module reads environment variables; every component
//! receives its paths through [`LockPaths`] or [`LockContext`].

use std::env;
use std::ffi::OsString;
use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use expand_tilde::ExpandTilde;

use crate::error::{EnvironmentError, LockError};
use crate::socket::SOCKET_ENV;

pub const APP_NAME: &str = "yule-log";

const CREDENTIAL_FILE_NAME: &str = "passwd";
const STATE_FILE_NAME: &str = "lock.state";

/// Where the credential and the lock ledger live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPaths {
    pub credential_file: PathBuf,
    pub state_file: PathBuf,
}

impl LockPaths {
    /// Resolve the default locations from the XDG environment.
    ///
    /// - credential: `$XDG_CONFIG_HOME/yule-log/passwd` or `~/.config/yule-log/passwd`
    /// - ledger: `$XDG_RUNTIME_DIR/yule-log/lock.state` or `$TMPDIR/yule-log-<uid>/lock.state`
    pub fn resolve() -> Result<Self, LockError> {
        Ok(Self::in_dirs(config_dir()?, runtime_dir()))
    }

    /// Place both files directly inside the given directories.
    pub fn in_dirs(config_dir: impl AsRef<Path>, runtime_dir: impl AsRef<Path>) -> Self {
        Self {
            credential_file: config_dir.as_ref().join(CREDENTIAL_FILE_NAME),
            state_file: runtime_dir.as_ref().join(STATE_FILE_NAME),
        }
    }
}

fn config_dir() -> Result<PathBuf, LockError> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| OsString::from("~/.config"));
    let base = PathBuf::from(base).expand_tilde_owned().map_err(|e| {
        LockError::storage("resolving configuration directory")(std::io::Error::other(
            e.to_string(),
        ))
    })?;
    Ok(base.join(APP_NAME))
}

fn runtime_dir() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir).join(APP_NAME),
        None => env::temp_dir().join(format!("{}-{}", APP_NAME, current_uid())),
    }
}

/// Paths plus the one piece of host environment the lock consumes.
#[derive(Debug, Clone)]
pub struct LockContext {
    pub paths: LockPaths,
    /// Raw tmux socket descriptor (`path,pid,session`), `None` outside tmux.
    pub socket_descriptor: Option<String>,
}

impl LockContext {
    pub fn new(paths: LockPaths, socket_descriptor: Option<String>) -> Self {
        Self {
            paths,
            socket_descriptor,
        }
    }

    /// Capture the socket descriptor from the `TMUX` environment variable.
    pub fn from_env(paths: LockPaths) -> Self {
        let descriptor = env::var_os(SOCKET_ENV).map(|v| v.to_string_lossy().into_owned());
        Self::new(paths, descriptor)
    }
}

/// Write `contents` to `path` readable only by the owner.
///
/// The parent directory is created with mode 0700 if needed and must be a
/// directory owned by the current user with no group or other access. The
/// data lands through a fresh temporary sibling and a rename, so readers
/// never observe a half-written file.
pub(crate) fn write_private(path: &Path, contents: &[u8], what: &str) -> Result<(), LockError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_private_dir(parent)?;

    let mut prefix = OsString::from(".");
    prefix.push(path.file_name().unwrap_or_default());
    prefix.push(".");

    // Created with O_EXCL and mode 0600 under a random name
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile_in(parent)
        .map_err(LockError::storage(format!("creating temporary {}", what)))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(LockError::storage(format!("writing {}", what)))?;
    tmp.persist(path)
        .map_err(|e| LockError::storage(format!("writing {}", what))(e.error))?;
    Ok(())
}

fn ensure_private_dir(dir: &Path) -> Result<(), LockError> {
    if !dir.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(LockError::storage(format!(
                "creating directory {}",
                dir.display()
            )))?;
    }

    let meta = fs::metadata(dir).map_err(LockError::storage(format!(
        "inspecting directory {}",
        dir.display()
    )))?;
    if !meta.is_dir() {
        return Err(LockError::storage(format!("using directory {}", dir.display()))(
            io::Error::from_raw_os_error(libc::ENOTDIR),
        ));
    }
    if meta.uid() != current_uid() || meta.mode() & 0o077 != 0 {
        log::error!(
            "Refusing {}: owner {} mode {:o}",
            dir.display(),
            meta.uid(),
            meta.mode() & 0o777
        );
        return Err(EnvironmentError::InsecureDirectory(dir.to_path_buf()).into());
    }
    Ok(())
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}
