//! The storage contract and the closed set of engines implementing it

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::lifecycle::LifecycleState;
use crate::modify::Modify;
use crate::raft::{RaftConfig, RaftStorage, RaftTransportService};
use crate::rocks::StorageReader;
use crate::standalone::StandaloneStorage;

/// Lifecycle and operation surface shared by every storage engine.
///
/// `start` runs at most once and must finish before the engine is served.
/// `stop` is idempotent. Reads and writes fail with
/// [`StorageError::NotRunning`](crate::StorageError::NotRunning) unless the
/// engine is `Running`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Perform all work needed before serving
    async fn start(&self) -> Result<()>;

    /// Release resources; a no-op once stopped
    async fn stop(&self) -> Result<()>;

    /// Apply a batch of modifies atomically
    async fn write(&self, batch: Vec<Modify>) -> Result<()>;

    /// A reader over the current state
    async fn reader(&self) -> Result<Box<dyn StorageReader>>;

    fn state(&self) -> LifecycleState;
}

/// Storage mode selected by configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Raft-replicated store coordinated by the scheduler
    Raft,
    /// Single-node store with no network dependency
    Standalone,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Raft => write!(f, "raft"),
            StorageMode::Standalone => write!(f, "standalone"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raft" => Ok(StorageMode::Raft),
            "standalone" => Ok(StorageMode::Standalone),
            _ => Err(format!("Invalid storage mode: {}", s)),
        }
    }
}

/// Everything an engine needs to be constructed
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub raft: bool,
    /// Only consulted by the Raft engine
    pub scheduler_addr: String,
    /// Address this store advertises to the scheduler and its peers
    pub store_addr: String,
    pub raftstore: RaftConfig,
}

impl StorageConfig {
    pub fn mode(&self) -> StorageMode {
        if self.raft {
            StorageMode::Raft
        } else {
            StorageMode::Standalone
        }
    }
}

/// The engine variant picked at startup
pub enum StorageEngine {
    Raft(RaftStorage),
    Standalone(StandaloneStorage),
}

impl StorageEngine {
    /// Pick the variant once from the `raft` flag
    pub fn from_config(config: StorageConfig) -> Self {
        let mode = config.mode();
        info!(mode = %mode, db_path = %config.db_path.display(), "Selected storage engine");
        match mode {
            StorageMode::Raft => StorageEngine::Raft(RaftStorage::new(config)),
            StorageMode::Standalone => {
                StorageEngine::Standalone(StandaloneStorage::new(config.db_path))
            }
        }
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            StorageEngine::Raft(_) => StorageMode::Raft,
            StorageEngine::Standalone(_) => StorageMode::Standalone,
        }
    }

    /// Peer transport to register next to the client service, if any
    pub fn raft_service(&self) -> Option<RaftTransportService> {
        match self {
            StorageEngine::Raft(storage) => storage.transport_service(),
            StorageEngine::Standalone(_) => None,
        }
    }
}

#[async_trait]
impl Storage for StorageEngine {
    async fn start(&self) -> Result<()> {
        match self {
            StorageEngine::Raft(storage) => storage.start().await,
            StorageEngine::Standalone(storage) => storage.start().await,
        }
    }

    async fn stop(&self) -> Result<()> {
        match self {
            StorageEngine::Raft(storage) => storage.stop().await,
            StorageEngine::Standalone(storage) => storage.stop().await,
        }
    }

    async fn write(&self, batch: Vec<Modify>) -> Result<()> {
        match self {
            StorageEngine::Raft(storage) => storage.write(batch).await,
            StorageEngine::Standalone(storage) => storage.write(batch).await,
        }
    }

    async fn reader(&self) -> Result<Box<dyn StorageReader>> {
        match self {
            StorageEngine::Raft(storage) => storage.reader().await,
            StorageEngine::Standalone(storage) => storage.reader().await,
        }
    }

    fn state(&self) -> LifecycleState {
        match self {
            StorageEngine::Raft(storage) => storage.state(),
            StorageEngine::Standalone(storage) => storage.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn config(dir: &std::path::Path, raft: bool) -> StorageConfig {
        StorageConfig {
            db_path: dir.to_path_buf(),
            raft,
            scheduler_addr: "127.0.0.1:1".to_string(),
            store_addr: "127.0.0.1:20160".to_string(),
            raftstore: RaftConfig::default(),
        }
    }

    #[test]
    fn test_storage_mode_display_and_parse() {
        assert_eq!(StorageMode::Raft.to_string(), "raft");
        assert_eq!(StorageMode::Standalone.to_string(), "standalone");
        assert_eq!("raft".parse::<StorageMode>().unwrap(), StorageMode::Raft);
        assert_eq!(
            "standalone".parse::<StorageMode>().unwrap(),
            StorageMode::Standalone
        );
        assert!("mysql".parse::<StorageMode>().is_err());
    }

    #[test]
    fn test_from_config_selects_variant() {
        let dir = tempfile::tempdir().unwrap();
        let raft = StorageEngine::from_config(config(dir.path(), true));
        assert_eq!(raft.mode(), StorageMode::Raft);
        assert_eq!(raft.state(), LifecycleState::Uninitialized);

        let standalone = StorageEngine::from_config(config(dir.path(), false));
        assert_eq!(standalone.mode(), StorageMode::Standalone);
        assert!(standalone.raft_service().is_none());
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::from_config(config(dir.path(), false));

        let err = engine
            .write(vec![Modify::put("default", "k", "v")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::NotRunning(LifecycleState::Uninitialized)
        ));
        assert!(engine.reader().await.is_err());
        // Nothing was created on disk
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_raft_start_fails_without_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), true);
        cfg.raftstore.rpc_timeout_ms = 200;
        let engine = StorageEngine::from_config(cfg);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, StorageError::Scheduler(_)));
        assert_eq!(engine.state(), LifecycleState::Failed);

        // Start is one-shot
        assert!(matches!(
            engine.start().await,
            Err(StorageError::AlreadyStarted(LifecycleState::Failed))
        ));
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), LifecycleState::Stopped);
    }
}
