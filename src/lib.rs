//! Library crate for portwatch-rs: TCP port sweeps over a changing address
//! inventory, with restart-safe state and Prometheus export.
pub mod cache;
pub mod config;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod ports;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod store;
pub mod types;

pub use error::{Error, Result};
