// Raft request and response types
// The application-level commands that go through Raft consensus

use serde::{Deserialize, Serialize};

use crate::modify::Modify;

/// All operations that go through Raft consensus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    /// Apply a batch of puts and deletes atomically
    Write { batch: Vec<Modify> },
}

impl RaftRequest {
    /// Short operation name for logging
    pub fn op_type(&self) -> &'static str {
        match self {
            RaftRequest::Write { .. } => "Write",
        }
    }
}

/// Response from applying a Raft request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl RaftResponse {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}
