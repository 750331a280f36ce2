use std::{env, fs::File, io::Read, path::PathBuf};

use clap_serde_derive::{
    clap::{self, Parser, Subcommand, ValueEnum},
    serde::{self, Deserialize, Serialize},
    ClapSerde,
};
use color_eyre::eyre::Result as EyreResult;
use expand_tilde::ExpandTilde;
use log::LevelFilter;
use yule_log::config::APP_NAME;
use yule_log::{LockOptions, LockPaths};

const APP_VERSION: &str = env!("YULE_LOG_BUILD_VERSION");

fn default_config_path() -> PathBuf {
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("~/.config"));

    config_dir
        .join(APP_NAME)
        .join(concat!(env!("CARGO_PKG_NAME"), ".toml"))
}

#[derive(Parser)]
#[command(author, version = APP_VERSION, about)]
pub struct Args {
    /// Config file
    #[arg(short, long = "config", global = true, default_value_os_t = default_config_path())]
    pub config_path: PathBuf,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Lock the tmux session until the password is entered
    Lock {
        /// Config from file or args
        #[command(flatten)]
        config: <Config as ClapSerde>::Opt,

        #[command(subcommand)]
        action: Option<LockAction>,
    },
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    /// Set or replace the unlock password
    SetPassword,

    /// Show whether a password is set and whether the session is locked
    Status,

    /// Undo a lock left behind by a process that died
    Recover,
}

#[derive(ClapSerde, Clone, Serialize)]
pub struct Config {
    /// Log level
    #[default(LogLevel::Warn)]
    #[arg(long, value_enum)]
    pub log_level: LogLevel,

    /// Optional log file (logs to standard error, otherwise)
    #[arg(long, num_args = 1)]
    pub log_file: Option<PathBuf>,

    /// Block new tmux clients from attaching while locked
    #[default(true)]
    #[arg(long, action = clap::ArgAction::Set)]
    pub socket_protect: bool,

    /// Password file (default: $XDG_CONFIG_HOME/yule-log/passwd)
    #[arg(long, num_args = 1)]
    pub credential_file: Option<PathBuf>,

    /// Lock state file (default: $XDG_RUNTIME_DIR/yule-log/lock.state)
    #[arg(long, num_args = 1)]
    pub state_file: Option<PathBuf>,

    /// Config file path (not an arg; copied from struct Args)
    #[arg(skip)]
    #[serde(skip_deserializing, skip_serializing)]
    pub config_path: PathBuf,
}

impl Config {
    /// Merge the config file, if present, with command line flags.
    pub fn load(config_path: PathBuf, mut config_opt: <Config as ClapSerde>::Opt) -> EyreResult<Self> {
        let config_path = config_path.expand_tilde_owned()?;
        let mut config = if let Ok(mut f) = File::open(&config_path) {
            let mut config_text = String::new();
            f.read_to_string(&mut config_text)?;
            let file_config = toml::from_str::<<Config as ClapSerde>::Opt>(&config_text)?;
            Config::from(file_config).merge(&mut config_opt)
        } else {
            Config::from(&mut config_opt)
        };

        config.config_path = config_path;
        config.log_file = config
            .log_file
            .map(|p| p.expand_tilde_owned())
            .transpose()?;
        config.credential_file = config
            .credential_file
            .map(|p| p.expand_tilde_owned())
            .transpose()?;
        config.state_file = config
            .state_file
            .map(|p| p.expand_tilde_owned())
            .transpose()?;

        Ok(config)
    }

    /// Default locations, with any configured overrides applied.
    pub fn lock_paths(&self) -> EyreResult<LockPaths> {
        let mut paths = LockPaths::resolve()?;
        if let Some(path) = &self.credential_file {
            paths.credential_file = path.clone();
        }
        if let Some(path) = &self.state_file {
            paths.state_file = path.clone();
        }
        Ok(paths)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            socket_protect: self.socket_protect,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    #[value(hide = true)]
    Trace = 5,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}
