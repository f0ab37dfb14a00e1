//! TinyKV server
//!
//! Brings a storage engine up, serves it over gRPC and takes it down again:
//! - [`model::config`]: configuration resolution (defaults, file, env, flags)
//! - [`startup::grpc`]: the service host and its transport policy
//! - [`startup::keepalive`]: HTTP/2 ping policing for inbound connections
//! - [`startup::shutdown`]: stop handle and signal supervisor
//! - [`service::raw`]: the raw key-value gRPC service

pub mod error;
pub mod model;
pub mod service;
pub mod startup;

pub use error::{Result, ServerError};
pub use model::config::{Cli, ConfigOverrides, Configuration};
