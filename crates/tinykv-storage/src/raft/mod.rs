// Raft-replicated engine built on openraft and RocksDB

pub mod config;
pub mod grpc_service;
pub mod log_store;
pub mod membership;
pub mod network;
pub mod request;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use config::RaftConfig;
pub use grpc_service::RaftTransportService;
pub use request::{RaftRequest, RaftResponse};
pub use storage::RaftStorage;
pub use types::{NodeId, RaftMetrics, TypeConfig};
