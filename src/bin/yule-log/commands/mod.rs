//! CLI command handlers for the lock.

use std::process::ExitCode;

use chrono::{DateTime, Local, Utc};
use color_eyre::eyre::Result as EyreResult;
use yule_log::credential::validate_new_password;
use yule_log::{LockManager, LockOptions, LockStatus, RecoveryOutcome};

use crate::cli::LockAction;
use crate::screen;

/// Output format for CLI commands
pub enum OutputFormat {
    Human,
    Json,
}

/// Run a lock subcommand; no subcommand locks the session.
pub fn run_command(
    manager: &LockManager,
    action: Option<LockAction>,
    options: LockOptions,
    format: OutputFormat,
) -> ExitCode {
    match action {
        None => cmd_lock(manager, options),
        Some(LockAction::SetPassword) => cmd_set_password(manager),
        Some(LockAction::Status) => cmd_status(manager, format),
        Some(LockAction::Recover) => cmd_recover(manager, format),
    }
}

/// Clean up after a lock whose process died, before doing anything else.
pub fn recover_on_start(manager: &LockManager) {
    match manager.recover() {
        Ok(RecoveryOutcome::Recovered { .. }) => {
            eprintln!("Recovered a stale lock left by a previous run.");
        }
        Ok(outcome) => log::debug!("Startup recovery: {:?}", outcome),
        Err(e) => log::warn!("Skipping stale lock recovery: {}", e),
    }
}

fn cmd_lock(manager: &LockManager, options: LockOptions) -> ExitCode {
    let episode = match manager.acquire(options) {
        Ok(episode) => episode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match screen::run_lock_screen(episode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_set_password(manager: &LockManager) -> ExitCode {
    match set_password(manager) {
        Ok(true) => {
            println!(
                "Password saved to {}",
                manager.credentials().path().display()
            );
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("Password unchanged.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns false if the user backed out.
fn set_password(manager: &LockManager) -> EyreResult<bool> {
    let store = manager.credentials();
    if store.exists() && !screen::confirm("A password is already set. Replace it?")? {
        return Ok(false);
    }

    let Some(password) = screen::prompt_secret("New password: ")? else {
        return Ok(false);
    };
    let Some(confirmation) = screen::prompt_secret("Confirm password: ")? else {
        return Ok(false);
    };

    let password = password.snapshot();
    let confirmation = confirmation.snapshot();
    validate_new_password(password.as_bytes(), confirmation.as_bytes())?;
    store.set_password(password.as_bytes())?;
    Ok(true)
}

fn cmd_status(manager: &LockManager, format: OutputFormat) -> ExitCode {
    let status = match manager.status() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match format {
        OutputFormat::Json => print_json(&status),
        OutputFormat::Human => {
            print_status_human(&status);
            ExitCode::SUCCESS
        }
    }
}

fn print_status_human(status: &LockStatus) {
    let password = if status.password_configured {
        "configured"
    } else {
        "not configured"
    };
    println!("  Password:       {}", password);

    if !status.locked {
        println!("  Lock:           unlocked");
        return;
    }

    let elapsed = status
        .locked_for_secs
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());
    println!("  Lock:           locked for {}", elapsed);
    if let Some(at) = status.locked_at {
        println!("  Since:          {}", format_timestamp(at));
    }
    match &status.socket_path {
        Some(path) => println!("  Socket:         {} (restricted)", path),
        None => println!("  Socket:         not protected"),
    }
    if let Some(pid) = status.pid {
        println!("  PID:            {}", pid);
    }
}

fn cmd_recover(manager: &LockManager, format: OutputFormat) -> ExitCode {
    let outcome = match manager.recover() {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match format {
        OutputFormat::Json => print_json(&outcome),
        OutputFormat::Human => {
            match &outcome {
                RecoveryOutcome::NothingToRecover => println!("No lock to recover."),
                RecoveryOutcome::Held { pid } => {
                    println!("Session is locked by running process {}; left alone.", pid)
                }
                RecoveryOutcome::OtherSocket { socket_path } => {
                    println!(
                        "Lock belongs to tmux socket {}, not this one; left alone.",
                        socket_path
                    )
                }
                RecoveryOutcome::Recovered {
                    socket_path,
                    socket_restored,
                } => {
                    println!("Removed stale lock.");
                    match (socket_path, socket_restored) {
                        (Some(path), true) => println!("Restored permissions on {}", path),
                        (Some(path), false) => println!("Socket {} no longer exists", path),
                        (None, _) => {}
                    }
                }
            }
            ExitCode::SUCCESS
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Format seconds as a human-readable duration
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
