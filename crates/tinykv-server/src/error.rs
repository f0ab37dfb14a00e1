//! Server error types

use tinykv_storage::{LifecycleState, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid store address '{addr}': {reason}")]
    InvalidStoreAddress { addr: String, reason: String },

    #[error("Storage engine is not running (state: {0})")]
    EngineNotRunning(LifecycleState),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Signal handling error: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
