use std::process::ExitCode;

use color_eyre::eyre::Result as EyreResult;
use yule_log::{LockContext, LockManager};

mod cli;
mod commands;
mod logging;
mod screen;

const BUILD_VERSION: &str = env!("YULE_LOG_BUILD_VERSION");
const GIT_DESCRIBE: &str = env!("YULE_LOG_GIT_DESCRIBE");

#[cfg(debug_assertions)]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(true)
        .install()
}

#[cfg(not(debug_assertions))]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .install()
}

fn main() -> ExitCode {
    // Install eyre hook for nice error formatting
    if let Err(e) = install_eyre_hook() {
        eprintln!("Failed to install error hook: {}", e);
        return ExitCode::FAILURE;
    }

    let args = cli::Args::parse();
    let format = if args.json {
        commands::OutputFormat::Json
    } else {
        commands::OutputFormat::Human
    };
    let cli::Command::Lock { config, action } = args.command;

    let config = match cli::Config::load(args.config_path, config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // LoggerHandle must be held until program termination so file logging takes place
    let _logger = match logging::setup_logger(config.log_level.into(), config.log_file.as_deref())
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: failed to start logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Starting yule-log version {}; commit {}",
        BUILD_VERSION,
        GIT_DESCRIBE
    );
    if config.config_path.exists() {
        log::info!("Read configuration from {}", config.config_path.display());
    }

    let paths = match config.lock_paths() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let manager = LockManager::new(LockContext::from_env(paths));

    if action != Some(cli::LockAction::Recover) {
        commands::recover_on_start(&manager);
    }

    commands::run_command(&manager, action, config.lock_options(), format)
}
