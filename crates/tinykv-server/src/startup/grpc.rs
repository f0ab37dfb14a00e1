//! gRPC service host
//!
//! One listener per process, bound on all interfaces at the port of the
//! configured store address. It serves `tinykvpb.TinyKv` and, for the
//! replicated engine, the Raft peer transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tinykv_api::raft_serverpb::raft_transport_server::RaftTransportServer;
use tinykv_api::tinykvpb::tiny_kv_server::TinyKvServer;
use tinykv_storage::{LifecycleState, Storage, StorageEngine};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

use super::keepalive::{KeepaliveEnforced, KeepalivePolicy};
use super::shutdown::{ConnectionCloser, StopHandle};
use crate::error::{Result, ServerError};
use crate::service::raw::TinyKvService;

/// Limits applied to every inbound connection
#[derive(Clone, Debug, PartialEq)]
pub struct TransportPolicy {
    pub max_recv_msg_size: usize,
    pub initial_window_size: u32,
    pub initial_conn_window_size: u32,
    pub keepalive: KeepalivePolicy,
    /// How long in-flight requests may run after a stop
    pub drain_timeout: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            max_recv_msg_size: 10 * 1024 * 1024,
            initial_window_size: 1 << 30,
            initial_conn_window_size: 1 << 30,
            keepalive: KeepalivePolicy::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// How long closed connections get to wind down their tasks
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Listen address derived from a store address: any host, the store's port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenAddr {
    port: u16,
}

impl ListenAddr {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.port)
    }
}

/// Drop the host part of `host:port` and keep the port
pub fn derive_listen_addr(store_addr: &str) -> Result<ListenAddr> {
    let invalid = |reason: &str| ServerError::InvalidStoreAddress {
        addr: store_addr.to_string(),
        reason: reason.to_string(),
    };

    let (_, port) = store_addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port separator"))?;
    let port = port.parse().map_err(|_| invalid("port is not a number"))?;
    Ok(ListenAddr { port })
}

/// A configured host that has not bound its listener yet
pub struct ServiceHost {
    engine: Arc<StorageEngine>,
    listen_addr: ListenAddr,
    policy: TransportPolicy,
    stop: StopHandle,
}

impl ServiceHost {
    /// Requires a running engine. The store address is validated here, before
    /// anything is bound.
    pub fn new(engine: Arc<StorageEngine>, store_addr: &str, policy: TransportPolicy) -> Result<Self> {
        let state = engine.state();
        if state != LifecycleState::Running {
            return Err(ServerError::EngineNotRunning(state));
        }
        let listen_addr = derive_listen_addr(store_addr)?;

        Ok(Self {
            engine,
            listen_addr,
            policy,
            stop: StopHandle::new(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn bind(self) -> Result<BoundHost> {
        let addr = self.listen_addr.socket_addr();
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let std_listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!("gRPC listener bound on {}", local_addr);

        Ok(BoundHost {
            engine: self.engine,
            listener,
            local_addr,
            policy: self.policy,
            stop: self.stop,
        })
    }

    /// Bind, then serve until stopped
    pub async fn serve(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// A host holding its listener
pub struct BoundHost {
    engine: Arc<StorageEngine>,
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
    policy: TransportPolicy,
    stop: StopHandle,
}

impl BoundHost {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Accept connections until a stop is requested or the transport fails.
    /// After a stop, in-flight requests get up to the drain timeout. Then
    /// every connection still open is closed before this returns.
    pub async fn serve(self) -> Result<()> {
        let policy = self.policy;
        let raw = TinyKvServer::new(TinyKvService::new(self.engine.clone()))
            .max_decoding_message_size(policy.max_recv_msg_size);
        let raft = self.engine.raft_service().map(|service| {
            RaftTransportServer::new(service).max_decoding_message_size(policy.max_recv_msg_size)
        });
        let with_raft = raft.is_some();

        let keepalive = policy.keepalive;
        let closer = Arc::new(ConnectionCloser::new());
        let incoming = {
            let closer = closer.clone();
            TcpListenerStream::new(self.listener).map(move |conn| {
                conn.map(|stream| KeepaliveEnforced::new(stream, keepalive, closer.signal()))
            })
        };

        let shutdown = {
            let stop = self.stop.clone();
            async move { stop.stopped().await }
        };

        let server = Server::builder()
            .initial_stream_window_size(policy.initial_window_size)
            .initial_connection_window_size(policy.initial_conn_window_size)
            .add_service(raw)
            .add_optional_service(raft)
            .serve_with_incoming_shutdown(incoming, shutdown);
        tokio::pin!(server);

        info!(
            addr = %self.local_addr,
            raft_transport = with_raft,
            "TinyKV server listening"
        );

        tokio::select! {
            result = &mut server => {
                // Returned without a stop request
                self.stop.stop();
                return result.map_err(|e| {
                    error!("gRPC server error: {}", e);
                    ServerError::Transport(e)
                });
            }
            _ = self.stop.stopped() => {}
        }

        info!(
            "Stopping gRPC server, draining for up to {:?}",
            policy.drain_timeout
        );
        match tokio::time::timeout(policy.drain_timeout, &mut server).await {
            Ok(Ok(())) => {
                info!("gRPC server stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("gRPC server error during shutdown: {}", e);
                Err(ServerError::Transport(e))
            }
            Err(_) => {
                warn!(
                    open = closer.open_connections(),
                    "Drain timed out after {:?}, closing remaining connections",
                    policy.drain_timeout
                );
                closer.close();
                if tokio::time::timeout(FORCE_CLOSE_GRACE, closer.all_closed())
                    .await
                    .is_err()
                {
                    warn!(
                        open = closer.open_connections(),
                        "Connections still open after close"
                    );
                }
                info!("gRPC server stopped");
                Ok(())
            }
        }
    }
}
