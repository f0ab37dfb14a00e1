//! Service host tests against a standalone engine

mod common;

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tinykv_api::tinykvpb::{RawDeleteRequest, RawGetRequest, RawPutRequest, RawScanRequest};
use tinykv_server::ServerError;
use tinykv_server::startup::{KeepalivePolicy, ServiceHost, TransportPolicy};
use tinykv_storage::{
    LifecycleState, RaftConfig, StandaloneStorage, Storage, StorageConfig, StorageEngine,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn standalone_engine(dir: &tempfile::TempDir) -> Arc<StorageEngine> {
    let engine = Arc::new(StorageEngine::Standalone(StandaloneStorage::new(
        dir.path().to_path_buf(),
    )));
    engine.start().await.unwrap();
    engine
}

#[tokio::test]
async fn test_raw_operations_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let host = common::serve(engine.clone(), "127.0.0.1:0", TransportPolicy::default()).await;
    let mut client = common::client(host.addr).await;

    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        let resp = client
            .raw_put(RawPutRequest {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
                cf: "default".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        assert!(resp.error.is_empty());
        assert!(resp.region_error.is_none());
    }

    // Same key in another column family stays separate
    client
        .raw_put(RawPutRequest {
            key: b"a".to_vec(),
            value: b"lock-a".to_vec(),
            cf: "lock".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let get = client
        .raw_get(RawGetRequest {
            key: b"a".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(get.value, b"1");

    let get = client
        .raw_get(RawGetRequest {
            key: b"a".to_vec(),
            cf: "lock".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(get.value, b"lock-a");

    let scan = client
        .raw_scan(RawScanRequest {
            start_key: b"b".to_vec(),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    let keys: Vec<_> = scan.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

    client
        .raw_delete(RawDeleteRequest {
            key: b"b".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();
    let get = client
        .raw_get(RawGetRequest {
            key: b"b".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(get.not_found);

    let status = client
        .raw_get(RawGetRequest {
            key: b"a".to_vec(),
            cf: "meta".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    drop(client);
    assert!(host.stop.stop());
    host.task.await.unwrap().unwrap();
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_serve_returns() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let policy = TransportPolicy {
        drain_timeout: Duration::from_secs(1),
        ..TransportPolicy::default()
    };
    let host = common::serve(engine.clone(), "127.0.0.1:0", policy).await;

    // An open connection holds up the stop for at most the drain timeout
    let _conn = TcpStream::connect(host.addr).await.unwrap();

    assert!(host.stop.stop());
    assert!(!host.stop.stop());
    let result = tokio::time::timeout(Duration::from_secs(10), host.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(!host.stop.stop());

    // The engine outlives the host until it is stopped explicitly
    assert_eq!(engine.state(), LifecycleState::Running);
    engine.stop().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_drain_timeout_bounds_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let policy = TransportPolicy {
        drain_timeout: Duration::from_millis(200),
        ..TransportPolicy::default()
    };
    let host = common::serve(engine.clone(), "127.0.0.1:0", policy).await;

    // An established gRPC connection left idle
    let mut client = common::client(host.addr).await;
    client
        .raw_put(RawPutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap();

    host.stop.stop();
    let result = tokio::time::timeout(Duration::from_secs(10), host.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_host_rejects_engine_that_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(StorageEngine::Standalone(StandaloneStorage::new(
        dir.path().to_path_buf(),
    )));

    let result = ServiceHost::new(engine.clone(), "127.0.0.1:0", TransportPolicy::default());
    assert!(matches!(
        result,
        Err(ServerError::EngineNotRunning(LifecycleState::Uninitialized))
    ));

    // Nothing was written before start
    assert!(engine.write(vec![]).await.is_err());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_failed_start_never_binds() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        db_path: dir.path().to_path_buf(),
        raft: true,
        scheduler_addr: "127.0.0.1:1".to_string(),
        store_addr: "127.0.0.1:20160".to_string(),
        raftstore: RaftConfig {
            rpc_timeout_ms: 500,
            ..RaftConfig::default()
        },
    };
    let engine = Arc::new(StorageEngine::from_config(config));

    assert!(engine.start().await.is_err());
    assert_eq!(engine.state(), LifecycleState::Failed);

    let result = ServiceHost::new(engine, "127.0.0.1:0", TransportPolicy::default());
    assert!(matches!(
        result,
        Err(ServerError::EngineNotRunning(LifecycleState::Failed))
    ));
}

#[tokio::test]
async fn test_bind_fails_when_port_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;

    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let store_addr = format!("127.0.0.1:{}", taken.local_addr().unwrap().port());

    let host = ServiceHost::new(engine.clone(), &store_addr, TransportPolicy::default()).unwrap();
    let result = host.serve().await;
    assert!(matches!(result, Err(ServerError::Bind { .. })));
    engine.stop().await.unwrap();
}

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    stream_frame(kind, 0, 0, payload)
}

fn stream_frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// HPACK block of literal fields, never indexed and without Huffman coding
fn header_block(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        out.push(0x00);
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Opens a unary RawPut on stream 1 without sending its body
fn raw_put_headers() -> Vec<u8> {
    let block = header_block(&[
        (":method", "POST"),
        (":scheme", "http"),
        (":path", "/tinykvpb.TinyKv/RawPut"),
        (":authority", "localhost"),
        ("content-type", "application/grpc"),
        ("te", "trailers"),
    ]);
    // END_HEADERS
    stream_frame(0x1, 0x4, 1, &block)
}

/// Length-prefixed gRPC message as the final DATA frame of stream 1
fn raw_put_body(request: &RawPutRequest) -> Vec<u8> {
    let message = request.encode_to_vec();
    let mut payload = vec![0u8];
    payload.extend_from_slice(&(message.len() as u32).to_be_bytes());
    payload.extend_from_slice(&message);
    // END_STREAM
    stream_frame(0x0, 0x1, 1, &payload)
}

fn settings() -> Vec<u8> {
    frame(0x4, &[])
}

fn ping() -> Vec<u8> {
    frame(0x6, &[1, 2, 3, 4, 5, 6, 7, 8])
}

/// Read until the peer closes the connection or `idle` passes without data.
/// Returns true if the connection was closed.
async fn closed_within(conn: &mut TcpStream, idle: Duration) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(idle, conn.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn test_drain_timeout_closes_open_streams() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let policy = TransportPolicy {
        drain_timeout: Duration::from_millis(200),
        ..TransportPolicy::default()
    };
    let host = common::serve(engine.clone(), "127.0.0.1:0", policy).await;

    // A request whose body has not arrived yet holds the drain open
    let mut conn = TcpStream::connect(host.addr).await.unwrap();
    let mut bytes = PREFACE.to_vec();
    bytes.extend(settings());
    bytes.extend(raw_put_headers());
    conn.write_all(&bytes).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    host.stop.stop();
    let result = tokio::time::timeout(Duration::from_secs(10), host.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    // The body sent after the host returned is never applied
    let late = RawPutRequest {
        key: b"late".to_vec(),
        value: b"v".to_vec(),
        ..Default::default()
    };
    let _ = conn.write_all(&raw_put_body(&late)).await;
    assert!(closed_within(&mut conn, Duration::from_secs(2)).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reader = engine.reader().await.unwrap();
    assert_eq!(reader.get_cf("default", b"late").unwrap(), None);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_rapid_pings_close_connection() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let host = common::serve(engine.clone(), "127.0.0.1:0", TransportPolicy::default()).await;

    let mut conn = TcpStream::connect(host.addr).await.unwrap();
    let mut bytes = PREFACE.to_vec();
    bytes.extend(settings());
    for _ in 0..4 {
        bytes.extend(ping());
    }
    conn.write_all(&bytes).await.unwrap();

    assert!(closed_within(&mut conn, Duration::from_secs(5)).await);

    host.stop.stop();
    host.task.await.unwrap().unwrap();
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_spaced_pings_keep_connection() {
    let dir = tempfile::tempdir().unwrap();
    let engine = standalone_engine(&dir).await;
    let policy = TransportPolicy {
        keepalive: KeepalivePolicy {
            min_time: Duration::from_millis(100),
            ..KeepalivePolicy::default()
        },
        ..TransportPolicy::default()
    };
    let host = common::serve(engine.clone(), "127.0.0.1:0", policy).await;

    let mut conn = TcpStream::connect(host.addr).await.unwrap();
    let mut bytes = PREFACE.to_vec();
    bytes.extend(settings());
    conn.write_all(&bytes).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        conn.write_all(&ping()).await.unwrap();
    }
    assert!(!closed_within(&mut conn, Duration::from_millis(500)).await);

    drop(conn);
    host.stop.stop();
    host.task.await.unwrap().unwrap();
    engine.stop().await.unwrap();
}
