// RocksDB plumbing shared by the standalone engine and the Raft state machine

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options,
    WriteBatch,
};
use tinykv_api::COLUMN_FAMILIES;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::modify::{Modify, validate_cf};

/// Column family for engine-private metadata (store identity, applied index)
pub const CF_META: &str = "meta";

/// Write buffer size: 64MB for better write throughput
const WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
/// Maximum number of write buffers for write stall prevention
const MAX_WRITE_BUFFER_NUMBER: i32 = 3;
/// Block cache size: 256MB for read optimization
const BLOCK_CACHE_SIZE: usize = 256 * 1024 * 1024;
/// Bloom filter bits per key for faster lookups
const BLOOM_FILTER_BITS_PER_KEY: f64 = 10.0;

/// Tuned DB-wide options plus per-CF options
fn tuned_options() -> (Options, Options) {
    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.create_missing_column_families(true);
    db_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
    db_opts.set_max_write_buffer_number(MAX_WRITE_BUFFER_NUMBER);
    db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    let mut block_opts = BlockBasedOptions::default();
    let cache = rocksdb::Cache::new_lru_cache(BLOCK_CACHE_SIZE);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(BLOOM_FILTER_BITS_PER_KEY, false);

    let mut cf_opts = Options::default();
    cf_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
    cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    cf_opts.set_block_based_table_factory(&block_opts);

    (db_opts, cf_opts)
}

/// Open a RocksDB instance with the given column families
pub(crate) fn open_db<P: AsRef<Path>>(path: P, column_families: &[&str]) -> Result<Arc<DB>> {
    std::fs::create_dir_all(path.as_ref())?;
    let (db_opts, cf_opts) = tuned_options();
    let cfs = column_families
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
        .collect::<Vec<_>>();

    let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs)?;
    debug!(path = %path.as_ref().display(), "Opened RocksDB");
    Ok(Arc::new(db))
}

/// Open the key-value database: client column families plus `meta`
pub(crate) fn open_kv_db<P: AsRef<Path>>(path: P) -> Result<Arc<DB>> {
    let mut cfs = COLUMN_FAMILIES.to_vec();
    cfs.push(CF_META);
    open_db(path, &cfs)
}

pub(crate) fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::UnknownColumnFamily(name.to_string()))
}

/// Fold a batch into a RocksDB write batch and apply it atomically
pub(crate) fn apply_modifies(db: &DB, modifies: &[Modify]) -> Result<()> {
    let mut batch = WriteBatch::default();
    for modify in modifies {
        match modify {
            Modify::Put { cf, key, value } => batch.put_cf(cf_handle(db, cf)?, key, value),
            Modify::Delete { cf, key } => batch.delete_cf(cf_handle(db, cf)?, key),
        }
    }
    db.write(batch)?;
    Ok(())
}

/// Point reads and range scans over the client column families
pub trait StorageReader: Send + Sync {
    /// Value stored under `key`, or `None` when absent
    fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` pairs in key order starting at `start_key` (inclusive)
    fn scan_cf(&self, cf: &str, start_key: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Reader over a RocksDB instance shared with its engine
#[derive(Clone)]
pub struct RocksDbReader {
    db: Arc<DB>,
}

impl RocksDbReader {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl StorageReader for RocksDbReader {
    fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_cf(cf)?;
        Ok(self.db.get_cf(cf_handle(&self.db, cf)?, key)?)
    }

    fn scan_cf(&self, cf: &str, start_key: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        validate_cf(cf)?;
        let handle = cf_handle(&self.db, cf)?;
        let mut pairs = Vec::with_capacity(limit.min(1024));
        for item in self
            .db
            .iterator_cf(handle, IteratorMode::From(start_key, Direction::Forward))
        {
            if pairs.len() >= limit {
                break;
            }
            let (key, value) = item?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_kv_db(dir.path()).unwrap();

        apply_modifies(
            &db,
            &[
                Modify::put("default", "a", "1"),
                Modify::put("default", "b", "2"),
                Modify::put("default", "c", "3"),
                Modify::put("lock", "a", "locked"),
            ],
        )
        .unwrap();

        let reader = RocksDbReader::new(db.clone());
        assert_eq!(reader.get_cf("default", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reader.get_cf("lock", b"a").unwrap(), Some(b"locked".to_vec()));
        assert_eq!(reader.get_cf("write", b"a").unwrap(), None);

        let pairs = reader.scan_cf("default", b"b", 10).unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec())
            ]
        );

        let limited = reader.scan_cf("default", b"", 2).unwrap();
        assert_eq!(limited.len(), 2);

        apply_modifies(&db, &[Modify::delete("default", "a")]).unwrap();
        assert_eq!(reader.get_cf("default", b"a").unwrap(), None);
    }

    #[test]
    fn test_meta_cf_is_not_client_visible() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_kv_db(dir.path()).unwrap();
        let reader = RocksDbReader::new(db);
        assert!(matches!(
            reader.get_cf(CF_META, b"anything"),
            Err(StorageError::UnknownColumnFamily(_))
        ));
    }
}
