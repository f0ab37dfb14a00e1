//! Configuration for the TinyKV server
//!
//! Resolution order, lowest to highest precedence:
//! 1. compiled-in defaults
//! 2. an optional TOML/YAML file given with `--config`
//! 3. `TINYKV_*` environment variables (nested keys separated by `__`,
//!    e.g. `TINYKV_TRANSPORT__DRAIN_TIMEOUT_MS`)
//! 4. command line flags
//!
//! An override only applies when it is present and non-empty.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use tinykv_storage::{RaftConfig, StorageConfig};

use crate::error::Result;
use crate::startup::grpc::TransportPolicy;
use crate::startup::keepalive::KeepalivePolicy;
use crate::startup::logging::{LogRotation, LoggingConfig, parse_level};

pub const DEFAULT_SCHEDULER_ADDR: &str = "127.0.0.1:2379";
pub const DEFAULT_STORE_ADDR: &str = "127.0.0.1:20160";
pub const DEFAULT_DB_PATH: &str = "/tmp/tinykv";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const ENV_PREFIX: &str = "TINYKV";
const ENV_SEPARATOR: &str = "__";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "tinykv-server", version, about = "TinyKV storage server")]
pub struct Cli {
    /// Scheduler address, used by the replicated engine
    #[arg(long = "scheduler", env = "TINYKV_SCHEDULER_ADDR")]
    pub scheduler: Option<String>,
    /// Store address as host:port; only the port is bound
    #[arg(long = "addr", env = "TINYKV_STORE_ADDR")]
    pub addr: Option<String>,
    /// Directory of the local database
    #[arg(long = "path", env = "TINYKV_DB_PATH")]
    pub path: Option<String>,
    /// trace, debug, info, warn, error or fatal
    #[arg(long = "loglevel", env = "TINYKV_LOG_LEVEL")]
    pub loglevel: Option<String>,
    /// Run the replicated engine (true) or the standalone one (false)
    #[arg(long = "raft", env = "TINYKV_RAFT", action = ArgAction::Set)]
    pub raft: Option<bool>,
    /// Optional configuration file
    #[arg(long = "config", env = "TINYKV_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            scheduler_addr: self.scheduler.clone(),
            store_addr: self.addr.clone(),
            db_path: self.path.clone(),
            log_level: self.loglevel.clone(),
            raft: self.raft,
        }
    }
}

/// Explicitly supplied values; `None` and empty strings mean "not supplied"
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub scheduler_addr: Option<String>,
    pub store_addr: Option<String>,
    pub db_path: Option<String>,
    pub log_level: Option<String>,
    pub raft: Option<bool>,
}

fn apply(field: &mut String, value: &Option<String>) {
    if let Some(value) = value
        && !value.is_empty()
    {
        field.clone_from(value);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_recv_msg_size: usize,
    pub initial_window_size: u32,
    pub initial_conn_window_size: u32,
    pub keepalive_min_time_ms: u64,
    pub keepalive_permit_without_stream: bool,
    pub max_ping_strikes: u32,
    pub drain_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_recv_msg_size: 10 * 1024 * 1024,
            initial_window_size: 1 << 30,
            initial_conn_window_size: 1 << 30,
            keepalive_min_time_ms: 2000,
            keepalive_permit_without_stream: true,
            max_ping_strikes: 2,
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Rolling log files are written here when set
    pub dir: Option<PathBuf>,
    pub console: bool,
    pub rotation: LogRotation,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            console: true,
            rotation: LogRotation::Daily,
        }
    }
}

/// Resolved server configuration, built once at startup and then only read
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub scheduler_addr: String,
    pub store_addr: String,
    pub db_path: String,
    pub log_level: String,
    pub raft: bool,
    pub raftstore: RaftConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            scheduler_addr: DEFAULT_SCHEDULER_ADDR.to_string(),
            store_addr: DEFAULT_STORE_ADDR.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            raft: true,
            raftstore: RaftConfig::default(),
            transport: TransportConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Configuration {
    /// Compiled defaults with the supplied overrides applied
    pub fn resolve(overrides: &ConfigOverrides) -> Self {
        Self::default().with_overrides(overrides)
    }

    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        apply(&mut self.scheduler_addr, &overrides.scheduler_addr);
        apply(&mut self.store_addr, &overrides.store_addr);
        apply(&mut self.db_path, &overrides.db_path);
        apply(&mut self.log_level, &overrides.log_level);
        if let Some(raft) = overrides.raft {
            self.raft = raft;
        }
        self
    }

    /// Defaults, then the optional file, then `TINYKV_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator(ENV_SEPARATOR)
            .ignore_empty(true)
            .try_parsing(true);
        Self::load_with(path, env)
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder.add_source(env).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Full startup resolution from parsed command line arguments
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self::load(cli.config.as_deref())?.with_overrides(&cli.overrides()))
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            db_path: PathBuf::from(&self.db_path),
            raft: self.raft,
            scheduler_addr: self.scheduler_addr.clone(),
            store_addr: self.store_addr.clone(),
            raftstore: self.raftstore.clone(),
        }
    }

    pub fn transport_policy(&self) -> TransportPolicy {
        let transport = &self.transport;
        TransportPolicy {
            max_recv_msg_size: transport.max_recv_msg_size,
            initial_window_size: transport.initial_window_size,
            initial_conn_window_size: transport.initial_conn_window_size,
            keepalive: KeepalivePolicy {
                min_time: Duration::from_millis(transport.keepalive_min_time_ms),
                permit_without_stream: transport.keepalive_permit_without_stream,
                max_ping_strikes: transport.max_ping_strikes,
            },
            drain_timeout: Duration::from_millis(transport.drain_timeout_ms),
        }
    }

    pub fn logging_config(&self) -> Result<LoggingConfig> {
        Ok(LoggingConfig {
            level: parse_level(&self.log_level)?,
            log_dir: self.log.dir.clone(),
            console_output: self.log.console,
            rotation: self.log.rotation,
        })
    }
}
