// gRPC services exposed to clients
pub mod raw;

pub use raw::TinyKvService;
