// RocksDB-based log storage for Raft
// Implements openraft's log storage traits on top of the `raft` database

// StorageError is from openraft and is large by its design
#![allow(clippy::result_large_err)]

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftLogReader, Vote};
use rocksdb::{ColumnFamily, DB, WriteBatch};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{NodeId, RaftStorageError, TypeConfig};
use crate::rocks::open_db;

// Column family names
const CF_LOGS: &str = "logs";
const CF_STATE: &str = "state";

// State keys
const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged";

fn vote_error(e: impl std::error::Error, verb: ErrorVerb) -> RaftStorageError {
    RaftStorageError::from_io_error(
        ErrorSubject::Vote,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn logs_error(e: impl std::error::Error, verb: ErrorVerb) -> RaftStorageError {
    RaftStorageError::from_io_error(
        ErrorSubject::Logs,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn missing_cf(name: &str) -> RaftStorageError {
    logs_error(
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("column family {name} missing"),
        ),
        ErrorVerb::Read,
    )
}

/// Encode log index to bytes (big-endian keeps RocksDB key order equal to index order)
fn encode_log_index(index: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, index);
    buf
}

fn decode_log_index(bytes: &[u8]) -> Option<u64> {
    (bytes.len() == 8).then(|| BigEndian::read_u64(bytes))
}

/// RocksDB-based log store for Raft
pub struct RocksLogStore {
    db: Arc<DB>,
    /// Cached last log ID
    last_log_id: RwLock<Option<LogId<NodeId>>>,
    /// Cached vote
    vote: RwLock<Option<Vote<NodeId>>>,
    /// Cached last purged log ID
    last_purged: RwLock<Option<LogId<NodeId>>>,
}

impl RocksLogStore {
    /// Open (or create) the log store under `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = open_db(path, &[CF_LOGS, CF_STATE])?;

        let store = Self {
            db,
            last_log_id: RwLock::new(None),
            vote: RwLock::new(None),
            last_purged: RwLock::new(None),
        };
        store
            .load_cached_values()
            .await
            .map_err(|e| crate::StorageError::Raft(e.to_string()))?;

        info!("RocksDB log store initialized");
        Ok(store)
    }

    async fn load_cached_values(&self) -> Result<(), RaftStorageError> {
        *self.vote.write().await = self.read_json(KEY_VOTE, ErrorSubject::Vote)?;
        *self.last_purged.write().await = self.read_json(KEY_LAST_PURGED, ErrorSubject::Logs)?;
        *self.last_log_id.write().await = self.calculate_last_log_id()?;
        Ok(())
    }

    fn cf_logs(&self) -> Result<&ColumnFamily, RaftStorageError> {
        self.db.cf_handle(CF_LOGS).ok_or_else(|| missing_cf(CF_LOGS))
    }

    fn cf_state(&self) -> Result<&ColumnFamily, RaftStorageError> {
        self.db.cf_handle(CF_STATE).ok_or_else(|| missing_cf(CF_STATE))
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &[u8],
        subject: ErrorSubject<NodeId>,
    ) -> Result<Option<T>, RaftStorageError> {
        let to_err = |e: String| {
            RaftStorageError::from_io_error(
                subject.clone(),
                ErrorVerb::Read,
                std::io::Error::other(e),
            )
        };
        match self
            .db
            .get_cf(self.cf_state()?, key)
            .map_err(|e| to_err(e.to_string()))?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| to_err(e.to_string())),
            None => Ok(None),
        }
    }

    fn serialize_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, RaftStorageError> {
        serde_json::to_vec(entry).map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, RaftStorageError> {
        serde_json::from_slice(bytes).map_err(|e| logs_error(e, ErrorVerb::Read))
    }

    /// Scan backwards from the end of the log for the last entry
    fn calculate_last_log_id(&self) -> Result<Option<LogId<NodeId>>, RaftStorageError> {
        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek_to_last();

        if iter.valid()
            && let Some(value) = iter.value()
        {
            let entry = Self::deserialize_entry(value)?;
            return Ok(Some(entry.log_id));
        }

        iter.status().map_err(|e| logs_error(e, ErrorVerb::Read))?;
        Ok(None)
    }

    /// Persist entries in one batch, returning the last log id written
    fn write_entries(
        &self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Option<LogId<NodeId>>, RaftStorageError> {
        let cf = self.cf_logs()?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(
                cf,
                encode_log_index(entry.log_id.index),
                Self::serialize_entry(entry)?,
            );
        }
        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        Ok(entries.last().map(|e| e.log_id))
    }
}

impl RaftLogReader<TypeConfig> for RocksLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, RaftStorageError> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };

        let mut entries = Vec::new();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek(encode_log_index(start));

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                let Some(index) = decode_log_index(key) else {
                    break;
                };
                if !range.contains(&index) {
                    break;
                }
                entries.push(Self::deserialize_entry(value)?);
            }
            iter.next();
        }
        iter.status().map_err(|e| logs_error(e, ErrorVerb::Read))?;

        debug!("Read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RocksLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError> {
        let last_purged = *self.last_purged.read().await;
        // With every entry purged the last log id is the purged one
        let last_log_id = self.last_log_id.read().await.or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), RaftStorageError> {
        let bytes = serde_json::to_vec(vote).map_err(|e| vote_error(e, ErrorVerb::Write))?;
        self.db
            .put_cf(self.cf_state()?, KEY_VOTE, bytes)
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;
        self.db
            .flush_wal(true)
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;

        *self.vote.write().await = Some(*vote);
        debug!("Saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, RaftStorageError> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        RocksLogStore {
            db: self.db.clone(),
            last_log_id: RwLock::new(*self.last_log_id.read().await),
            vote: RwLock::new(*self.vote.read().await),
            last_purged: RwLock::new(*self.last_purged.read().await),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), RaftStorageError>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        if let Some(log_id) = self.write_entries(&entries)? {
            *self.last_log_id.write().await = Some(log_id);
        }

        debug!("Appended {} log entries", entries.len());
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), RaftStorageError> {
        // Entries at and after log_id.index are removed
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(
            self.cf_logs()?,
            encode_log_index(log_id.index),
            encode_log_index(u64::MAX),
        );
        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;

        let last = self.calculate_last_log_id()?;
        *self.last_log_id.write().await = last;

        debug!("Truncated logs since index {}", log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), RaftStorageError> {
        // Entries up to and including log_id.index are removed
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(
            self.cf_logs()?,
            encode_log_index(0),
            encode_log_index(log_id.index + 1),
        );
        let last_purged_bytes =
            serde_json::to_vec(&log_id).map_err(|e| logs_error(e, ErrorVerb::Write))?;
        batch.put_cf(self.cf_state()?, KEY_LAST_PURGED, last_purged_bytes);

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;

        *self.last_purged.write().await = Some(log_id);

        debug!("Purged logs up to index {}", log_id.index);
        Ok(())
    }
}
