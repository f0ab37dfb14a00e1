// Raft type configuration for openraft

use std::io::Cursor;

use super::request::{RaftRequest, RaftResponse};

/// Node ID type: the store id allocated by the scheduler
pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = RaftRequest,
        R = RaftResponse,
        Node = openraft::BasicNode,
        NodeId = NodeId,
);

/// Type alias for the Raft instance
pub type Raft = openraft::Raft<TypeConfig>;

/// Type alias for stored membership
pub type StoredMembership = openraft::StoredMembership<NodeId, openraft::BasicNode>;

/// Type alias for metrics
pub type RaftMetrics = openraft::RaftMetrics<NodeId, openraft::BasicNode>;

/// Storage error as openraft reports it
pub type RaftStorageError = openraft::StorageError<NodeId>;
