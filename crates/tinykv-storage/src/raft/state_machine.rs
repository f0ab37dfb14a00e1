// Raft state machine implementation
// Applies committed write batches to the `kv` RocksDB instance

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StoredMembership,
};
use rocksdb::{ColumnFamily, DB, IteratorMode, WriteBatch};
use tinykv_api::COLUMN_FAMILIES;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::request::{RaftRequest, RaftResponse};
use super::types::{NodeId, RaftStorageError, TypeConfig};
use crate::rocks::{CF_META, apply_modifies};

// Meta keys
const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_LAST_MEMBERSHIP: &[u8] = b"last_membership";

fn sm_error(e: impl std::error::Error, verb: ErrorVerb) -> RaftStorageError {
    RaftStorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Serialized client column families: cf name to ordered key/value pairs
type SnapshotData = HashMap<String, Vec<(Vec<u8>, Vec<u8>)>>;

/// The most recently built or installed snapshot
#[derive(Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, openraft::BasicNode>,
    data: Vec<u8>,
}

/// RocksDB-based state machine for Raft
pub struct RocksStateMachine {
    db: Arc<DB>,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    last_membership: RwLock<StoredMembership<NodeId, openraft::BasicNode>>,
    current_snapshot: Arc<RwLock<Option<StoredSnapshot>>>,
}

impl RocksStateMachine {
    /// Build a state machine over an already opened `kv` database
    pub async fn new(db: Arc<DB>) -> crate::Result<Self> {
        let sm = Self {
            db,
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            current_snapshot: Arc::new(RwLock::new(None)),
        };
        sm.load_cached_values()
            .await
            .map_err(|e| crate::StorageError::Raft(e.to_string()))?;

        info!("RocksDB state machine initialized");
        Ok(sm)
    }

    async fn load_cached_values(&self) -> Result<(), RaftStorageError> {
        let cf = self.cf_meta()?;
        if let Some(bytes) = self
            .db
            .get_cf(cf, KEY_LAST_APPLIED)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let log_id: LogId<NodeId> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_applied.write().await = Some(log_id);
        }

        if let Some(bytes) = self
            .db
            .get_cf(cf, KEY_LAST_MEMBERSHIP)
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        {
            let membership: StoredMembership<NodeId, openraft::BasicNode> =
                serde_json::from_slice(&bytes).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            *self.last_membership.write().await = membership;
        }

        Ok(())
    }

    fn cf_meta(&self) -> Result<&ColumnFamily, RaftStorageError> {
        self.cf(CF_META)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, RaftStorageError> {
        self.db.cf_handle(name).ok_or_else(|| {
            sm_error(
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("column family {name} missing"),
                ),
                ErrorVerb::Read,
            )
        })
    }

    /// Apply a single request. Request-level failures become failed responses.
    fn apply_request(&self, request: RaftRequest) -> RaftResponse {
        match request {
            RaftRequest::Write { batch } => match apply_modifies(&self.db, &batch) {
                Ok(()) => RaftResponse::success(),
                Err(e) => {
                    error!("Failed to apply write batch: {}", e);
                    RaftResponse::failure(format!("Failed to apply write batch: {}", e))
                }
            },
        }
    }

    async fn save_last_applied(&self, log_id: LogId<NodeId>) -> Result<(), RaftStorageError> {
        let bytes = serde_json::to_vec(&log_id).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_LAST_APPLIED, bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_applied.write().await = Some(log_id);
        Ok(())
    }

    async fn save_membership(
        &self,
        membership: StoredMembership<NodeId, openraft::BasicNode>,
    ) -> Result<(), RaftStorageError> {
        let bytes = serde_json::to_vec(&membership).map_err(|e| sm_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_meta()?, KEY_LAST_MEMBERSHIP, bytes)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.last_membership.write().await = membership;
        Ok(())
    }

    fn dump_client_cfs(&self) -> Result<SnapshotData, RaftStorageError> {
        let mut data = SnapshotData::new();
        for cf_name in COLUMN_FAMILIES {
            let cf = self.cf(cf_name)?;
            let pairs = self
                .db
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| sm_error(e, ErrorVerb::Read))?;
            data.insert(cf_name.to_string(), pairs);
        }
        Ok(data)
    }

    /// Replace every client column family with the snapshot contents in one batch
    fn restore_client_cfs(&self, data: SnapshotData) -> Result<(), RaftStorageError> {
        let mut batch = WriteBatch::default();
        for cf_name in COLUMN_FAMILIES {
            let cf = self.cf(cf_name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item.map_err(|e| sm_error(e, ErrorVerb::Read))?;
                batch.delete_cf(cf, key);
            }
        }
        for (cf_name, pairs) in data {
            let cf = self.cf(&cf_name)?;
            for (key, value) in pairs {
                batch.put_cf(cf, key, value);
            }
        }
        self.db
            .write(batch)
            .map_err(|e| sm_error(e, ErrorVerb::Write))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RocksStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, RaftStorageError> {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();

        let snapshot_id = format!(
            "snapshot-{}-{}",
            last_applied.map(|l| l.index).unwrap_or(0),
            chrono::Utc::now().timestamp_millis()
        );

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: snapshot_id.clone(),
        };

        let data = serde_json::to_vec(&self.dump_client_cfs()?)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        *self.current_snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        info!("Built snapshot {} with {} bytes", snapshot_id, data.len());

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for RocksStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<NodeId>>,
            StoredMembership<NodeId, openraft::BasicNode>,
        ),
        RaftStorageError,
    > {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();
        Ok((last_applied, last_membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<RaftResponse>, RaftStorageError>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;

            let response = match entry.payload {
                EntryPayload::Normal(request) => {
                    debug!("Applying {} at {}", request.op_type(), log_id);
                    self.apply_request(request)
                }
                EntryPayload::Membership(membership) => {
                    let stored = StoredMembership::new(Some(log_id), membership);
                    self.save_membership(stored).await?;
                    RaftResponse::success()
                }
                EntryPayload::Blank => RaftResponse::success(),
            };

            self.save_last_applied(log_id).await?;
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, RaftStorageError> {
        Ok(self
            .current_snapshot
            .read()
            .await
            .clone()
            .map(|stored| Snapshot {
                meta: stored.meta,
                snapshot: Box::new(Cursor::new(stored.data)),
            }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        RocksStateMachine {
            db: self.db.clone(),
            last_applied: RwLock::new(*self.last_applied.read().await),
            last_membership: RwLock::new(self.last_membership.read().await.clone()),
            current_snapshot: self.current_snapshot.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, RaftStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), RaftStorageError> {
        let data = snapshot.into_inner();

        if !data.is_empty() {
            let snapshot_data: SnapshotData =
                serde_json::from_slice(&data).map_err(|e| sm_error(e, ErrorVerb::Read))?;
            self.restore_client_cfs(snapshot_data)?;
        }

        if let Some(log_id) = meta.last_log_id {
            self.save_last_applied(log_id).await?;
        }
        self.save_membership(meta.last_membership.clone()).await?;

        *self.current_snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        info!("Snapshot installed: {:?}", meta.snapshot_id);
        Ok(())
    }
}
