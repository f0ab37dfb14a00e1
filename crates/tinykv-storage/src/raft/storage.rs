// Raft-replicated storage engine
// Owns the openraft node, its RocksDB log store and state machine, and the
// membership reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use openraft::BasicNode;
use openraft::error::{
    CheckIsLeaderError, ClientWriteError, ForwardToLeader, InitializeError, RaftError,
};
use parking_lot::RwLock;
use rocksdb::DB;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::grpc_service::RaftTransportService;
use super::log_store::RocksLogStore;
use super::membership::spawn_reconciler;
use super::network::StoreNetworkFactory;
use super::request::RaftRequest;
use super::scheduler::{SchedulerClient, local_store};
use super::state_machine::RocksStateMachine;
use super::types::{NodeId, Raft, RaftMetrics};
use crate::engine::{Storage, StorageConfig};
use crate::error::{Result, StorageError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::modify::{Modify, validate_batch};
use crate::rocks::{CF_META, RocksDbReader, StorageReader, cf_handle, open_kv_db};

const KEY_STORE_IDENT: &[u8] = b"store_ident";

fn not_leader(fwd: ForwardToLeader<NodeId, BasicNode>) -> StorageError {
    StorageError::NotLeader {
        leader_id: fwd.leader_id,
        leader_addr: fwd.leader_node.map(|n| n.addr),
    }
}

fn raft_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Raft(e.to_string())
}

/// Everything that exists only while the engine runs
struct RaftRuntime {
    store_id: NodeId,
    raft: Raft,
    kv: Arc<DB>,
    reconciler: JoinHandle<()>,
}

pub struct RaftStorage {
    config: StorageConfig,
    lifecycle: Lifecycle,
    runtime: RwLock<Option<Arc<RaftRuntime>>>,
}

impl RaftStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
            runtime: RwLock::new(None),
        }
    }

    fn runtime(&self) -> Result<Arc<RaftRuntime>> {
        self.lifecycle.ensure_running()?;
        self.runtime
            .read()
            .clone()
            .ok_or_else(|| StorageError::NotRunning(self.lifecycle.state()))
    }

    /// Store id allocated to this store, once started
    pub fn store_id(&self) -> Option<NodeId> {
        self.runtime.read().as_ref().map(|rt| rt.store_id)
    }

    pub fn metrics(&self) -> Option<RaftMetrics> {
        self.runtime
            .read()
            .as_ref()
            .map(|rt| rt.raft.metrics().borrow().clone())
    }

    /// Service answering peer RPCs for this store's Raft node
    pub fn transport_service(&self) -> Option<RaftTransportService> {
        self.runtime
            .read()
            .as_ref()
            .map(|rt| RaftTransportService::new(rt.store_id, rt.raft.clone()))
    }

    /// Load the persisted store id, or allocate one and persist it
    async fn store_ident(kv: &DB, scheduler: &SchedulerClient) -> Result<NodeId> {
        let meta = cf_handle(kv, CF_META)?;
        if let Some(bytes) = kv.get_cf(meta, KEY_STORE_IDENT)?
            && bytes.len() == 8
        {
            let id = BigEndian::read_u64(&bytes);
            info!("Loaded store id {}", id);
            return Ok(id);
        }

        let id = scheduler.alloc_id().await?;
        if id == 0 {
            return Err(StorageError::Scheduler("allocated store id 0".to_string()));
        }
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, id);
        kv.put_cf(meta, KEY_STORE_IDENT, buf)?;
        kv.flush_wal(true)?;
        info!("Allocated store id {}", id);
        Ok(id)
    }

    /// Bring the node up. The returned runtime is only installed on success.
    async fn bootstrap(&self) -> Result<RaftRuntime> {
        let kv_path = self.config.db_path.join("kv");
        let raft_path = self.config.db_path.join("raft");
        std::fs::create_dir_all(&kv_path)?;
        std::fs::create_dir_all(&raft_path)?;

        let kv = open_kv_db(&kv_path)?;
        let log_store = RocksLogStore::open(&raft_path).await?;
        let state_machine = RocksStateMachine::new(kv.clone()).await?;

        let raftstore = &self.config.raftstore;
        let scheduler =
            SchedulerClient::connect(&self.config.scheduler_addr, raftstore.rpc_timeout()).await?;

        let store_id = Self::store_ident(&kv, &scheduler).await?;
        let store = local_store(store_id, &self.config.store_addr);
        scheduler.put_store(store.clone()).await?;

        let raft_config = Arc::new(raftstore.to_openraft_config().validate().map_err(raft_error)?);
        let network = StoreNetworkFactory::new(store_id, raftstore.rpc_timeout());
        let raft = Raft::new(store_id, raft_config, network, log_store, state_machine)
            .await
            .map_err(raft_error)?;

        if let Err(e) = self.join_cluster(&raft, &scheduler, store_id).await {
            if let Err(shutdown) = raft.shutdown().await {
                warn!("Failed to shut down raft after start error: {}", shutdown);
            }
            return Err(e);
        }

        let reconciler = spawn_reconciler(raft.clone(), scheduler, raftstore.reconcile_interval());

        Ok(RaftRuntime {
            store_id,
            raft,
            kv,
            reconciler,
        })
    }

    /// Bootstrap the cluster through the scheduler when nobody has yet
    async fn join_cluster(
        &self,
        raft: &Raft,
        scheduler: &SchedulerClient,
        store_id: NodeId,
    ) -> Result<()> {
        if scheduler.is_bootstrapped().await? {
            info!("Cluster already bootstrapped, waiting to be added by the leader");
            return Ok(());
        }

        let store = local_store(store_id, &self.config.store_addr);
        if !scheduler.bootstrap(store).await? {
            info!("Another store bootstrapped the cluster first");
            return Ok(());
        }

        let members = BTreeMap::from([(
            store_id,
            BasicNode {
                addr: self.config.store_addr.clone(),
            },
        )]);
        match raft.initialize(members).await {
            Ok(()) => {
                info!("Bootstrapped cluster with store {}", store_id);
                Ok(())
            }
            // Local raft state already exists, e.g. after a scheduler restart
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                info!("Raft already initialized: {}", e);
                Ok(())
            }
            Err(e) => Err(raft_error(e)),
        }
    }
}

#[async_trait]
impl Storage for RaftStorage {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;
        info!(
            scheduler = %self.config.scheduler_addr,
            store_addr = %self.config.store_addr,
            "Starting raft storage"
        );

        match self.bootstrap().await {
            Ok(runtime) => {
                let store_id = runtime.store_id;
                *self.runtime.write() = Some(Arc::new(runtime));
                self.lifecycle.finish_start(true);
                info!("Raft storage started as store {}", store_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start raft storage: {}", e);
                self.lifecycle.finish_start(false);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let runtime = self.runtime.write().take();
        let Some(runtime) = runtime else {
            self.lifecycle.finish_stop();
            return Ok(());
        };

        runtime.reconciler.abort();
        let mut result = runtime.raft.shutdown().await.map_err(raft_error);
        if let Err(e) = runtime.kv.flush() {
            warn!("Failed to flush kv database: {}", e);
            result = result.and(Err(e.into()));
        }

        self.lifecycle.finish_stop();
        info!("Raft storage stopped");
        result
    }

    async fn write(&self, batch: Vec<Modify>) -> Result<()> {
        let runtime = self.runtime()?;
        validate_batch(&batch)?;

        match runtime.raft.client_write(RaftRequest::Write { batch }).await {
            Ok(resp) if resp.data.success => Ok(()),
            Ok(resp) => Err(StorageError::Raft(resp.data.message.unwrap_or_default())),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                Err(not_leader(fwd))
            }
            Err(e) => Err(raft_error(e)),
        }
    }

    async fn reader(&self) -> Result<Box<dyn StorageReader>> {
        let runtime = self.runtime()?;

        match runtime.raft.ensure_linearizable().await {
            Ok(_) => Ok(Box::new(RocksDbReader::new(runtime.kv.clone()))),
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(fwd))) => {
                Err(not_leader(fwd))
            }
            Err(e) => Err(raft_error(e)),
        }
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }
}
