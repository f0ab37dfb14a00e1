// Raft gRPC service implementation
// Handles incoming Raft RPC requests from peer stores

use serde::Serialize;
use serde::de::DeserializeOwned;
use tinykv_api::raft_serverpb::RaftMessage;
use tinykv_api::raft_serverpb::raft_transport_server::RaftTransport;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use super::types::{NodeId, Raft};

/// gRPC service that feeds peer messages into the local Raft node
#[derive(Clone)]
pub struct RaftTransportService {
    store_id: NodeId,
    raft: Raft,
}

impl RaftTransportService {
    pub fn new(store_id: NodeId, raft: Raft) -> Self {
        Self { store_id, raft }
    }

    /// Check addressing and decode the JSON payload
    fn decode<T: DeserializeOwned>(&self, message: &RaftMessage) -> Result<T, Status> {
        if message.to_store != self.store_id {
            warn!(
                "Rejecting raft message from store {} addressed to store {}, local store is {}",
                message.from_store, message.to_store, self.store_id
            );
            return Err(Status::failed_precondition(format!(
                "message addressed to store {}, this is store {}",
                message.to_store, self.store_id
            )));
        }
        serde_json::from_slice(&message.payload)
            .map_err(|e| Status::invalid_argument(format!("invalid raft payload: {}", e)))
    }

    fn reply<T: Serialize>(&self, to: NodeId, result: &T) -> Result<Response<RaftMessage>, Status> {
        let payload = serde_json::to_vec(result)
            .map_err(|e| Status::internal(format!("failed to encode raft reply: {}", e)))?;
        Ok(Response::new(RaftMessage {
            from_store: self.store_id,
            to_store: to,
            payload,
        }))
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn append_entries(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let message = request.into_inner();
        let req = self.decode(&message)?;
        let result = self.raft.append_entries(req).await;
        self.reply(message.from_store, &result)
    }

    async fn vote(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        let message = request.into_inner();
        let req = self.decode(&message)?;
        debug!("Received Vote from store {}", message.from_store);
        let result = self.raft.vote(req).await;
        self.reply(message.from_store, &result)
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let message = request.into_inner();
        let req = self.decode(&message)?;
        debug!("Received InstallSnapshot from store {}", message.from_store);
        let result = self.raft.install_snapshot(req).await;
        self.reply(message.from_store, &result)
    }
}
