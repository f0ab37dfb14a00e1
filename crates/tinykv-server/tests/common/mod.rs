//! Shared helpers for TinyKV server integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tinykv_api::schedulerpb::scheduler_server::{Scheduler, SchedulerServer};
use tinykv_api::schedulerpb::{
    AllocIdRequest, AllocIdResponse, BootstrapRequest, BootstrapResponse, Error, ErrorType,
    GetAllStoresRequest, GetAllStoresResponse, IsBootstrappedRequest, IsBootstrappedResponse,
    PutStoreRequest, PutStoreResponse, ResponseHeader, Store, StoreState,
};
use tinykv_api::tinykvpb::tiny_kv_client::TinyKvClient;
use tinykv_server::error::Result;
use tinykv_server::startup::{ServiceHost, StopHandle, TransportPolicy};
use tinykv_storage::StorageEngine;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

#[derive(Default)]
struct SchedulerState {
    last_id: u64,
    bootstrapped: bool,
    stores: BTreeMap<u64, Store>,
}

/// In-memory scheduler with just enough behavior for stores to join
#[derive(Clone, Default)]
pub struct MockScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

fn error_header(kind: ErrorType, message: &str) -> Option<ResponseHeader> {
    Some(ResponseHeader {
        error: Some(Error {
            r#type: kind as i32,
            message: message.to_string(),
        }),
    })
}

impl MockScheduler {
    pub fn stores(&self) -> Vec<Store> {
        self.state.lock().unwrap().stores.values().cloned().collect()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.state.lock().unwrap().bootstrapped
    }
}

#[tonic::async_trait]
impl Scheduler for MockScheduler {
    async fn alloc_id(
        &self,
        _request: Request<AllocIdRequest>,
    ) -> std::result::Result<Response<AllocIdResponse>, Status> {
        let mut state = self.state.lock().unwrap();
        state.last_id += 1;
        Ok(Response::new(AllocIdResponse {
            header: Some(ResponseHeader::default()),
            id: state.last_id,
        }))
    }

    async fn is_bootstrapped(
        &self,
        _request: Request<IsBootstrappedRequest>,
    ) -> std::result::Result<Response<IsBootstrappedResponse>, Status> {
        let state = self.state.lock().unwrap();
        Ok(Response::new(IsBootstrappedResponse {
            header: Some(ResponseHeader::default()),
            bootstrapped: state.bootstrapped,
        }))
    }

    async fn bootstrap(
        &self,
        request: Request<BootstrapRequest>,
    ) -> std::result::Result<Response<BootstrapResponse>, Status> {
        let store = request
            .into_inner()
            .store
            .ok_or_else(|| Status::invalid_argument("missing store"))?;
        let mut state = self.state.lock().unwrap();
        if state.bootstrapped {
            return Ok(Response::new(BootstrapResponse {
                header: error_header(ErrorType::AlreadyBootstrapped, "cluster is bootstrapped"),
            }));
        }
        state.bootstrapped = true;
        state.stores.insert(store.id, store);
        Ok(Response::new(BootstrapResponse {
            header: Some(ResponseHeader::default()),
        }))
    }

    async fn put_store(
        &self,
        request: Request<PutStoreRequest>,
    ) -> std::result::Result<Response<PutStoreResponse>, Status> {
        let store = request
            .into_inner()
            .store
            .ok_or_else(|| Status::invalid_argument("missing store"))?;
        self.state.lock().unwrap().stores.insert(store.id, store);
        Ok(Response::new(PutStoreResponse {
            header: Some(ResponseHeader::default()),
        }))
    }

    async fn get_all_stores(
        &self,
        request: Request<GetAllStoresRequest>,
    ) -> std::result::Result<Response<GetAllStoresResponse>, Status> {
        let exclude_tombstone = request.into_inner().exclude_tombstone_stores;
        let stores = self
            .state
            .lock()
            .unwrap()
            .stores
            .values()
            .filter(|s| !exclude_tombstone || s.state != StoreState::Tombstone as i32)
            .cloned()
            .collect();
        Ok(Response::new(GetAllStoresResponse {
            header: Some(ResponseHeader::default()),
            stores,
        }))
    }
}

/// Serve a fresh mock scheduler on an ephemeral port
pub async fn spawn_scheduler() -> (String, MockScheduler) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scheduler = MockScheduler::default();
    let service = SchedulerServer::new(scheduler.clone());
    tokio::spawn(async move {
        Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    (addr.to_string(), scheduler)
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub struct RunningHost {
    pub addr: SocketAddr,
    pub stop: StopHandle,
    pub task: JoinHandle<Result<()>>,
}

/// Bind a host for `engine` and serve it in the background
pub async fn serve(
    engine: Arc<StorageEngine>,
    store_addr: &str,
    policy: TransportPolicy,
) -> RunningHost {
    let host = ServiceHost::new(engine, store_addr, policy)
        .unwrap()
        .bind()
        .await
        .unwrap();
    let port = host.local_addr().port();
    let stop = host.stop_handle();
    let task = tokio::spawn(host.serve());
    RunningHost {
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        stop,
        task,
    }
}

pub async fn client(addr: SocketAddr) -> TinyKvClient<Channel> {
    TinyKvClient::connect(format!("http://{}", addr))
        .await
        .unwrap()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
