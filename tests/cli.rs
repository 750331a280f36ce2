use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Output,
};

use duct::Expression;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const BIN: &str = env!("CARGO_BIN_EXE_yule-log");

/// Runs the binary against private config and runtime directories.
struct YuleLog {
    dir: TempDir,
}

impl YuleLog {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    fn config_home(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    fn runtime_dir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    fn credential_file(&self) -> PathBuf {
        self.config_home().join("yule-log").join("passwd")
    }

    fn state_file(&self) -> PathBuf {
        self.runtime_dir().join("yule-log").join("lock.state")
    }

    fn cmd(&self, args: &[&str]) -> Expression {
        duct::cmd(BIN, args.iter().copied())
            .env("XDG_CONFIG_HOME", self.config_home())
            .env("XDG_RUNTIME_DIR", self.runtime_dir())
            .env_remove("TMUX")
            .stdout_capture()
            .stderr_capture()
            .unchecked()
    }

    fn run(&self, args: &[&str]) -> Result<Output, std::io::Error> {
        self.cmd(args).stdin_null().run()
    }

    fn set_password(&self, password: &str) -> Result<Output, std::io::Error> {
        self.cmd(&["lock", "set-password"])
            .stdin_bytes(format!("{}\n{}\n", password, password))
            .run()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn mode(path: &Path) -> Result<u32, std::io::Error> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[test]
fn status_of_fresh_install() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule.run(&["lock", "status"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("not configured"), "stdout: {}", text);
    assert!(text.contains("unlocked"), "stdout: {}", text);
    Ok(())
}

#[test]
fn status_as_json() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule.run(&["--json", "lock", "status"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["password_configured"], false);
    assert_eq!(status["locked"], false);
    Ok(())
}

#[test]
fn lock_without_password_fails() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule.run(&["lock"])?;
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("no password configured"),
        "stderr: {}",
        stderr(&output)
    );
    assert!(!yule.state_file().exists());
    Ok(())
}

#[test]
fn set_password_then_status() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule.set_password("correct horse")?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let stored = fs::read_to_string(yule.credential_file())?;
    assert!(stored.starts_with("$argon2id$v=19$"), "stored: {}", stored);
    assert!(stored.ends_with('\n'));
    assert!(!stored.contains("correct horse"));
    assert_eq!(mode(&yule.credential_file())?, 0o600);

    let output = yule.run(&["--json", "lock", "status"])?;
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["password_configured"], true);
    Ok(())
}

#[test]
fn set_password_rejects_mismatch() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule
        .cmd(&["lock", "set-password"])
        .stdin_bytes("first\nsecond\n")
        .run()?;
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("passwords do not match"),
        "stderr: {}",
        stderr(&output)
    );
    assert!(!yule.credential_file().exists());
    Ok(())
}

#[test]
fn set_password_rejects_empty() -> TestResult {
    let yule = YuleLog::new()?;

    let output = yule.set_password("")?;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("password cannot be empty"));
    assert!(!yule.credential_file().exists());
    Ok(())
}

#[test]
fn replacing_password_needs_confirmation() -> TestResult {
    let yule = YuleLog::new()?;
    assert!(yule.set_password("first")?.status.success());
    let original = fs::read_to_string(yule.credential_file())?;

    let output = yule
        .cmd(&["lock", "set-password"])
        .stdin_bytes("n\n")
        .run()?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Password unchanged"));
    assert_eq!(fs::read_to_string(yule.credential_file())?, original);

    let output = yule
        .cmd(&["lock", "set-password"])
        .stdin_bytes("y\nsecond\nsecond\n")
        .run()?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_ne!(fs::read_to_string(yule.credential_file())?, original);
    Ok(())
}

#[test]
fn lock_outside_tmux_fails() -> TestResult {
    let yule = YuleLog::new()?;
    assert!(yule.set_password("pw")?.status.success());

    let output = yule.run(&["lock"])?;
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("TMUX environment variable not set"),
        "stderr: {}",
        stderr(&output)
    );
    assert!(!yule.state_file().exists());
    Ok(())
}

#[test]
fn recover_removes_stale_record() -> TestResult {
    let yule = YuleLog::new()?;
    fs::create_dir_all(yule.state_file().parent().ok_or("no parent")?)?;
    fs::write(
        yule.state_file(),
        r#"{"locked": true, "locked_at": "2025-01-01T00:00:00Z", "socket_path": "", "socket_permission": 0, "pid": 0}"#,
    )?;

    let output = yule.run(&["lock", "status"])?;
    // Startup recovery already cleans it up
    assert!(stdout(&output).contains("unlocked"), "stdout: {}", stdout(&output));
    assert!(!yule.state_file().exists());

    let output = yule.run(&["lock", "recover"])?;
    assert!(output.status.success());
    assert!(stdout(&output).contains("No lock to recover"));
    Ok(())
}

#[test]
fn recover_reports_as_json() -> TestResult {
    let yule = YuleLog::new()?;
    fs::create_dir_all(yule.state_file().parent().ok_or("no parent")?)?;
    fs::write(
        yule.state_file(),
        r#"{"locked": true, "locked_at": "2025-01-01T00:00:00Z", "socket_path": "", "socket_permission": 0, "pid": 0}"#,
    )?;

    let output = yule.run(&["--json", "lock", "recover"])?;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let outcome: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(outcome["outcome"], "recovered");
    assert_eq!(outcome["socket_restored"], false);
    assert!(!yule.state_file().exists());
    Ok(())
}
