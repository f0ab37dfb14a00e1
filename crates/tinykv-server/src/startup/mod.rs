//! Process startup: logging, the service host and stop handling

pub mod grpc;
pub mod keepalive;
pub mod logging;
pub mod shutdown;

pub use grpc::{BoundHost, ListenAddr, ServiceHost, TransportPolicy, derive_listen_addr};
pub use keepalive::{KeepaliveEnforced, KeepalivePolicy};
pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{
    CloseSignal, ConnectionCloser, ProcessSupervisor, StopHandle, TerminationSignal, os_signals,
};
