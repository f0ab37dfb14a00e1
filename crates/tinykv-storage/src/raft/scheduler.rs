// Scheduler client
// The calls a replicated store makes to learn its identity and its peers

use std::time::Duration;

use tinykv_api::schedulerpb::scheduler_client::SchedulerClient as GrpcSchedulerClient;
use tinykv_api::schedulerpb::{
    AllocIdRequest, BootstrapRequest, ErrorType, GetAllStoresRequest, IsBootstrappedRequest,
    PutStoreRequest, ResponseHeader, Store, StoreState,
};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::error::{Result, StorageError};

/// Thin wrapper over the generated scheduler client
#[derive(Clone)]
pub struct SchedulerClient {
    client: GrpcSchedulerClient<Channel>,
}

/// Turn a response header carrying an error into a `StorageError`
fn check_header(header: Option<ResponseHeader>) -> Result<()> {
    match header.and_then(|h| h.error) {
        Some(error) if error.r#type() != ErrorType::Ok => Err(StorageError::Scheduler(format!(
            "{:?}: {}",
            error.r#type(),
            error.message
        ))),
        _ => Ok(()),
    }
}

fn rpc_error(status: tonic::Status) -> StorageError {
    StorageError::Scheduler(status.to_string())
}

impl SchedulerClient {
    /// Connect eagerly so an unreachable scheduler fails engine start
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let endpoint = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        debug!("Connecting to scheduler at {}", endpoint);

        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| StorageError::Scheduler(format!("invalid scheduler address: {}", e)))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect()
            .await
            .map_err(|e| {
                StorageError::Scheduler(format!("failed to connect to {}: {}", endpoint, e))
            })?;

        info!("Connected to scheduler at {}", addr);
        Ok(Self {
            client: GrpcSchedulerClient::new(channel),
        })
    }

    pub async fn alloc_id(&self) -> Result<u64> {
        let resp = self
            .client
            .clone()
            .alloc_id(AllocIdRequest {})
            .await
            .map_err(rpc_error)?
            .into_inner();
        check_header(resp.header)?;
        Ok(resp.id)
    }

    pub async fn is_bootstrapped(&self) -> Result<bool> {
        let resp = self
            .client
            .clone()
            .is_bootstrapped(IsBootstrappedRequest {})
            .await
            .map_err(rpc_error)?
            .into_inner();
        check_header(resp.header)?;
        Ok(resp.bootstrapped)
    }

    /// Try to bootstrap the cluster with `store`. Returns false when another
    /// store got there first.
    pub async fn bootstrap(&self, store: Store) -> Result<bool> {
        let resp = self
            .client
            .clone()
            .bootstrap(BootstrapRequest { store: Some(store) })
            .await
            .map_err(rpc_error)?
            .into_inner();
        if let Some(error) = resp.header.as_ref().and_then(|h| h.error.as_ref())
            && error.r#type() == ErrorType::AlreadyBootstrapped
        {
            return Ok(false);
        }
        check_header(resp.header)?;
        Ok(true)
    }

    pub async fn put_store(&self, store: Store) -> Result<()> {
        let resp = self
            .client
            .clone()
            .put_store(PutStoreRequest { store: Some(store) })
            .await
            .map_err(rpc_error)?
            .into_inner();
        check_header(resp.header)
    }

    /// Every store that is not a tombstone
    pub async fn get_all_stores(&self) -> Result<Vec<Store>> {
        let resp = self
            .client
            .clone()
            .get_all_stores(GetAllStoresRequest {
                exclude_tombstone_stores: true,
            })
            .await
            .map_err(rpc_error)?
            .into_inner();
        check_header(resp.header)?;
        Ok(resp
            .stores
            .into_iter()
            .filter(|s| s.state() != StoreState::Tombstone)
            .collect())
    }
}

/// The scheduler's view of this store
pub fn local_store(id: u64, address: &str) -> Store {
    Store {
        id,
        address: address.to_string(),
        state: StoreState::Up as i32,
    }
}

#[cfg(test)]
mod tests {
    use tinykv_api::schedulerpb::Error as SchedulerError;

    use super::*;

    #[test]
    fn test_check_header() {
        assert!(check_header(None).is_ok());
        assert!(check_header(Some(ResponseHeader { error: None })).is_ok());

        let err = check_header(Some(ResponseHeader {
            error: Some(SchedulerError {
                r#type: ErrorType::NotBootstrapped as i32,
                message: "cluster is not bootstrapped".to_string(),
            }),
        }))
        .unwrap_err();
        assert!(err.to_string().contains("not bootstrapped"));
    }

    #[test]
    fn test_local_store() {
        let store = local_store(7, "127.0.0.1:20160");
        assert_eq!(store.id, 7);
        assert_eq!(store.state(), StoreState::Up);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let result = SchedulerClient::connect("127.0.0.1:1", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(StorageError::Scheduler(_))));
    }
}
