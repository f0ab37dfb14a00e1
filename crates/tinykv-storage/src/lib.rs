//! TinyKV storage engines
//!
//! A single [`Storage`] contract with two implementations:
//! - [`StandaloneStorage`]: one local RocksDB instance
//! - [`RaftStorage`]: writes replicated through openraft, store identity and
//!   peer discovery through the scheduler
//!
//! [`StorageEngine`] is the closed set of the two, chosen once from
//! [`StorageConfig`].

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod modify;
pub mod raft;
pub mod rocks;
pub mod standalone;

pub use engine::{Storage, StorageConfig, StorageEngine, StorageMode};
pub use error::{Result, StorageError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use modify::Modify;
pub use raft::{RaftConfig, RaftStorage, RaftTransportService};
pub use rocks::{RocksDbReader, StorageReader};
pub use standalone::StandaloneStorage;
