//! Core of the resource broker.
//!
//! # Architecture
//!
//! - `vault`: ChaCha20-Poly1305 encryption of stored secrets
//! - `validation`: Command, identifier and WHERE-clause gate
//! - `mutex`: Per-key FIFO async mutexes
//! - `pool`: Mutex-guarded connection pool over a `Connector`
//! - `profile`: Liveness-tested, encrypted profile store
//! - `usage`: Ring-buffer usage statistics
//! - `transport`: russh and sqlx connectors
//! - `service`: The `Broker` facade tying it together

pub mod config;
pub mod error;
pub mod mutex;
pub mod pool;
pub mod profile;
pub mod service;
pub mod storage;
pub mod transport;
pub mod types;
pub mod usage;
pub mod validation;
pub mod vault;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use service::Broker;
pub use types::{AuthMode, ProfileExtra, ProfileInput, ProfileSummary, ResourceType};
