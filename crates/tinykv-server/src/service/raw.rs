//! Client-facing raw key-value gRPC service

use std::sync::Arc;

use tinykv_api::CF_DEFAULT;
use tinykv_api::tinykvpb::tiny_kv_server::TinyKv;
use tinykv_api::tinykvpb::{
    KvPair, NotLeader, RawDeleteRequest, RawDeleteResponse, RawGetRequest, RawGetResponse,
    RawPutRequest, RawPutResponse, RawScanRequest, RawScanResponse, RegionError,
};
use tinykv_storage::modify::validate_cf;
use tinykv_storage::{Modify, Storage, StorageEngine, StorageError};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

/// Storage failure as carried in a response body
#[derive(Debug, Default, PartialEq)]
struct ErrorFields {
    region_error: Option<RegionError>,
    error: String,
}

/// Map a storage error to response fields. Invalid arguments fail the call.
fn error_fields(e: StorageError) -> Result<ErrorFields, Status> {
    match e {
        StorageError::UnknownColumnFamily(cf) => Err(Status::invalid_argument(format!(
            "unknown column family '{}'",
            cf
        ))),
        StorageError::NotLeader {
            leader_id,
            leader_addr,
        } => {
            let message = format!("not leader, leader is {:?}", leader_id);
            Ok(ErrorFields {
                region_error: Some(RegionError {
                    message,
                    not_leader: Some(NotLeader {
                        leader_id: leader_id.unwrap_or_default(),
                        leader_addr: leader_addr.unwrap_or_default(),
                    }),
                }),
                error: String::new(),
            })
        }
        other => {
            warn!("Raw request failed: {}", other);
            Ok(ErrorFields {
                region_error: None,
                error: other.to_string(),
            })
        }
    }
}

/// An empty column family means `default`
fn column_family(cf: &str) -> Result<String, Status> {
    let cf = if cf.is_empty() { CF_DEFAULT } else { cf };
    validate_cf(cf).map_err(|e| Status::invalid_argument(e.to_string()))?;
    Ok(cf.to_string())
}

/// Serves `tinykvpb.TinyKv` on top of whichever engine is running
#[derive(Clone)]
pub struct TinyKvService {
    engine: Arc<StorageEngine>,
}

impl TinyKvService {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    async fn write(&self, modify: Modify) -> Result<ErrorFields, Status> {
        match self.engine.write(vec![modify]).await {
            Ok(()) => Ok(ErrorFields::default()),
            Err(e) => error_fields(e),
        }
    }
}

#[tonic::async_trait]
impl TinyKv for TinyKvService {
    async fn raw_get(
        &self,
        request: Request<RawGetRequest>,
    ) -> Result<Response<RawGetResponse>, Status> {
        let req = request.into_inner();
        let cf = column_family(&req.cf)?;

        let result = match self.engine.reader().await {
            Ok(reader) => reader.get_cf(&cf, &req.key),
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(Some(value)) => RawGetResponse {
                value,
                ..Default::default()
            },
            Ok(None) => RawGetResponse {
                not_found: true,
                ..Default::default()
            },
            Err(e) => {
                let fields = error_fields(e)?;
                RawGetResponse {
                    region_error: fields.region_error,
                    error: fields.error,
                    ..Default::default()
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn raw_put(
        &self,
        request: Request<RawPutRequest>,
    ) -> Result<Response<RawPutResponse>, Status> {
        let req = request.into_inner();
        let cf = column_family(&req.cf)?;
        debug!(cf = %cf, key_len = req.key.len(), "RawPut");

        let fields = self.write(Modify::put(cf, req.key, req.value)).await?;
        Ok(Response::new(RawPutResponse {
            region_error: fields.region_error,
            error: fields.error,
        }))
    }

    async fn raw_delete(
        &self,
        request: Request<RawDeleteRequest>,
    ) -> Result<Response<RawDeleteResponse>, Status> {
        let req = request.into_inner();
        let cf = column_family(&req.cf)?;
        debug!(cf = %cf, key_len = req.key.len(), "RawDelete");

        let fields = self.write(Modify::delete(cf, req.key)).await?;
        Ok(Response::new(RawDeleteResponse {
            region_error: fields.region_error,
            error: fields.error,
        }))
    }

    async fn raw_scan(
        &self,
        request: Request<RawScanRequest>,
    ) -> Result<Response<RawScanResponse>, Status> {
        let req = request.into_inner();
        let cf = column_family(&req.cf)?;

        let result = match self.engine.reader().await {
            Ok(reader) => reader.scan_cf(&cf, &req.start_key, req.limit as usize),
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(pairs) => RawScanResponse {
                kvs: pairs
                    .into_iter()
                    .map(|(key, value)| KvPair { key, value })
                    .collect(),
                ..Default::default()
            },
            Err(e) => {
                let fields = error_fields(e)?;
                RawScanResponse {
                    region_error: fields.region_error,
                    error: fields.error,
                    ..Default::default()
                }
            }
        };
        Ok(Response::new(response))
    }
}
