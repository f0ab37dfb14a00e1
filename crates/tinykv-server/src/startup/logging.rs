//! Logging setup for the server process.
//!
//! Console output is always available. When a log directory is configured,
//! rolling files are written there as well:
//!
//! | Log File       | Component                     | Target Prefixes                     |
//! |----------------|-------------------------------|-------------------------------------|
//! | tinykv.log     | Root logger (all components)  | (all)                               |
//! | raftstore.log  | Raft engine and scheduler     | tinykv_storage::raft, openraft      |
//! | server.log     | Service host and gRPC service | tinykv_server                       |
//!
//! `RUST_LOG` overrides the configured level for the console and root file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{Result, ServerError};

const ROOT_LOG_FILE: &str = "tinykv.log";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "raftstore.log",
        targets: &["tinykv_storage::raft", "openraft"],
    },
    ComponentLogDef {
        file_name: "server.log",
        targets: &["tinykv_server"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Parse a configured verbosity. `fatal` has no tracing equivalent and
/// maps to `error`.
pub fn parse_level(level: &str) -> Result<Level> {
    let level = level.trim();
    if level.eq_ignore_ascii_case("fatal") {
        return Ok(Level::ERROR);
    }
    level
        .parse()
        .map_err(|_| ServerError::Logging(format!("unknown log level '{}'", level)))
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Directory for rolling log files; no files when unset
    pub log_dir: Option<PathBuf>,
    pub console_output: bool,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_dir: None,
            console_output: true,
            rotation: LogRotation::Daily,
        }
    }
}

/// Keeps the non-blocking file writers alive. Buffered output is flushed
/// when dropped.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(level_filter(config.level));
        layers.push(Box::new(console_layer));
    }

    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            ServerError::Logging(format!("cannot create {}: {}", log_dir.display(), e))
        })?;

        let root_appender = RollingFileAppender::new(config.rotation.into(), log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(level_filter(config.level));
        layers.push(Box::new(root_layer));

        let component_level = LevelFilter::from_level(config.level);
        for component in COMPONENT_LOGS {
            let appender =
                RollingFileAppender::new(config.rotation.into(), log_dir, component.file_name);
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, component_level);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| ServerError::Logging(format!("failed to initialize logging: {}", e)))?;

    if let Some(log_dir) = &config.log_dir {
        tracing::info!(
            log_dir = %log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("warn").unwrap(), Level::WARN);
        assert_eq!(parse_level("fatal").unwrap(), Level::ERROR);
        assert_eq!(parse_level(" trace ").unwrap(), Level::TRACE);
        assert!(matches!(
            parse_level("loud"),
            Err(ServerError::Logging(_))
        ));
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(config.log_dir.is_none());
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_log_rotation_conversion() {
        assert!(matches!(
            Rotation::from(LogRotation::Daily),
            Rotation::DAILY
        ));
        assert!(matches!(
            Rotation::from(LogRotation::Hourly),
            Rotation::HOURLY
        ));
        assert!(matches!(
            Rotation::from(LogRotation::Never),
            Rotation::NEVER
        ));
    }

    #[test]
    fn test_log_rotation_deserialize() {
        let rotation: LogRotation = serde_json::from_str("\"hourly\"").unwrap();
        assert_eq!(rotation, LogRotation::Hourly);
        assert!(serde_json::from_str::<LogRotation>("\"weekly\"").is_err());
    }

    #[test]
    fn test_component_log_definitions() {
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert_ne!(component.file_name, ROOT_LOG_FILE);
            assert!(!component.targets.is_empty());
        }
    }
}
