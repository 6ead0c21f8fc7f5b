//! Shared building blocks for the alarm pipeline services
//!
//! - logging bootstrap
//! - configuration loading
//! - graceful shutdown
//! - the data-store contract and its SQLite implementation

pub mod config_loader;
pub mod logging;
pub mod shutdown;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use store::{DataStore, Row, SqlValue, StoreError, StoreResult, StoreTransaction, WriteResult};
