// Raft network layer for store-to-store communication
// Implements openraft's network traits over the RaftTransport gRPC service

use std::time::Duration;

use openraft::BasicNode;
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tinykv_api::raft_serverpb::RaftMessage;
use tinykv_api::raft_serverpb::raft_transport_client::RaftTransportClient;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use super::types::{NodeId, TypeConfig};

type RpcResult<T, E> = Result<T, RPCError<NodeId, BasicNode, RaftError<NodeId, E>>>;

/// Factory for creating connections to peer stores
pub struct StoreNetworkFactory {
    store_id: NodeId,
    rpc_timeout: Duration,
}

impl StoreNetworkFactory {
    pub fn new(store_id: NodeId, rpc_timeout: Duration) -> Self {
        Self {
            store_id,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for StoreNetworkFactory {
    type Network = StoreConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        StoreConnection::new(self.store_id, target, node.addr.clone(), self.rpc_timeout)
    }
}

#[derive(Clone, Copy, Debug)]
enum RpcKind {
    AppendEntries,
    Vote,
    InstallSnapshot,
}

/// A lazily connected channel to one peer store
pub struct StoreConnection {
    from: NodeId,
    target: NodeId,
    addr: String,
    rpc_timeout: Duration,
    client: Option<RaftTransportClient<Channel>>,
}

impl StoreConnection {
    pub fn new(from: NodeId, target: NodeId, addr: String, rpc_timeout: Duration) -> Self {
        Self {
            from,
            target,
            addr,
            rpc_timeout,
            client: None,
        }
    }

    async fn client(&mut self) -> Result<RaftTransportClient<Channel>, tonic::transport::Error> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }

        let endpoint = format!("http://{}", self.addr);
        debug!("Connecting to store {} at {}", self.target, endpoint);
        let channel = Endpoint::from_shared(endpoint)?
            .connect_timeout(self.rpc_timeout)
            .timeout(self.rpc_timeout)
            .connect()
            .await?;

        let client = RaftTransportClient::new(channel);
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Send one JSON-encoded openraft request and decode the peer's `Result`
    async fn call<Req, Resp, E>(&mut self, kind: RpcKind, req: &Req) -> RpcResult<Resp, E>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(req).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        let message = RaftMessage {
            from_store: self.from,
            to_store: self.target,
            payload,
        };

        let mut client = self.client().await.map_err(|e| {
            warn!("Failed to connect to store {} at {}: {}", self.target, self.addr, e);
            RPCError::Unreachable(Unreachable::new(&e))
        })?;

        let reply = match kind {
            RpcKind::AppendEntries => client.append_entries(message).await,
            RpcKind::Vote => client.vote(message).await,
            RpcKind::InstallSnapshot => client.install_snapshot(message).await,
        };

        let reply = match reply {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                debug!("{:?} to store {} failed: {}", kind, self.target, status);
                // Force a reconnect next time
                self.client = None;
                return Err(if status.code() == tonic::Code::Unavailable {
                    RPCError::Unreachable(Unreachable::new(&status))
                } else {
                    RPCError::Network(NetworkError::new(&status))
                });
            }
        };

        let result: Result<Resp, RaftError<NodeId, E>> = serde_json::from_slice(&reply.payload)
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for StoreConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.call(RpcKind::AppendEntries, &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, InstallSnapshotError> {
        self.call(RpcKind::InstallSnapshot, &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.call(RpcKind::Vote, &req).await
    }
}
