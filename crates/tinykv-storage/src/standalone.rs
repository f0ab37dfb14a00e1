//! Single-node engine: one RocksDB instance, no network dependency

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::DB;
use tracing::{info, warn};

use crate::engine::Storage;
use crate::error::{Result, StorageError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::modify::{Modify, validate_batch};
use crate::rocks::{RocksDbReader, StorageReader, apply_modifies, open_kv_db};

pub struct StandaloneStorage {
    db_path: PathBuf,
    lifecycle: Lifecycle,
    db: RwLock<Option<Arc<DB>>>,
}

impl StandaloneStorage {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            lifecycle: Lifecycle::new(),
            db: RwLock::new(None),
        }
    }

    fn db(&self) -> Result<Arc<DB>> {
        self.lifecycle.ensure_running()?;
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::NotRunning(self.lifecycle.state()))
    }
}

#[async_trait]
impl Storage for StandaloneStorage {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;
        match open_kv_db(&self.db_path) {
            Ok(db) => {
                *self.db.write() = Some(db);
                self.lifecycle.finish_start(true);
                info!(path = %self.db_path.display(), "Standalone storage started");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.finish_start(false);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let db = self.db.write().take();
        let result = match db {
            Some(db) => db.flush().map_err(StorageError::from),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!("Failed to flush standalone storage: {}", e);
        }
        self.lifecycle.finish_stop();
        info!("Standalone storage stopped");
        result
    }

    async fn write(&self, batch: Vec<Modify>) -> Result<()> {
        let db = self.db()?;
        validate_batch(&batch)?;
        apply_modifies(&db, &batch)
    }

    async fn reader(&self) -> Result<Box<dyn StorageReader>> {
        Ok(Box::new(RocksDbReader::new(self.db()?)))
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}
