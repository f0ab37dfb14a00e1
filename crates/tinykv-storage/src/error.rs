//! Error types for the storage engines

use crate::lifecycle::LifecycleState;

/// Errors raised by a storage engine
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage engine is not running (state: {0})")]
    NotRunning(LifecycleState),

    #[error("storage engine was already started (state: {0})")]
    AlreadyStarted(LifecycleState),

    #[error("unknown column family '{0}'")]
    UnknownColumnFamily(String),

    #[error("not leader (leader: {leader_id:?} at {leader_addr:?})")]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Result alias pinned to [`StorageError`]
pub type Result<T> = std::result::Result<T, StorageError>;
