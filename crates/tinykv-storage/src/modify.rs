//! Write operations accepted by every storage engine

use serde::{Deserialize, Serialize};
use tinykv_api::COLUMN_FAMILIES;

use crate::error::{Result, StorageError};

/// A single mutation inside a write batch.
///
/// A batch is applied atomically: either every modify lands or none does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modify {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
}

impl Modify {
    pub fn put(cf: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Modify::Put {
            cf: cf.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(cf: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Modify::Delete {
            cf: cf.into(),
            key: key.into(),
        }
    }

    pub fn cf(&self) -> &str {
        match self {
            Modify::Put { cf, .. } | Modify::Delete { cf, .. } => cf,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Modify::Put { key, .. } | Modify::Delete { key, .. } => key,
        }
    }
}

/// Reject column families clients are not allowed to touch
pub fn validate_cf(cf: &str) -> Result<()> {
    if COLUMN_FAMILIES.contains(&cf) {
        Ok(())
    } else {
        Err(StorageError::UnknownColumnFamily(cf.to_string()))
    }
}

/// Validate every column family in a batch before anything is applied
pub fn validate_batch(batch: &[Modify]) -> Result<()> {
    batch.iter().try_for_each(|m| validate_cf(m.cf()))
}
