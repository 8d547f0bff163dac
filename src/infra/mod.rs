//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http_purge;
pub mod http_store;
pub mod telemetry;
