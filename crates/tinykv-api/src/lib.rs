//! TinyKV API - gRPC service definitions
//!
//! This crate provides the generated tonic/prost code for:
//! - `tinykvpb`: the client-facing raw key-value service
//! - `raft_serverpb`: the transport Raft peers use to replicate the log
//! - `schedulerpb`: the scheduler calls a replicated store makes at startup

pub mod tinykvpb {
    tonic::include_proto!("tinykvpb");
}

pub mod raft_serverpb {
    tonic::include_proto!("raft_serverpb");
}

pub mod schedulerpb {
    tonic::include_proto!("schedulerpb");
}

/// Column family holding user values.
pub const CF_DEFAULT: &str = "default";
/// Column family holding transaction locks.
pub const CF_LOCK: &str = "lock";
/// Column family holding commit records.
pub const CF_WRITE: &str = "write";

/// All column families a store exposes to clients.
pub const COLUMN_FAMILIES: [&str; 3] = [CF_DEFAULT, CF_LOCK, CF_WRITE];
