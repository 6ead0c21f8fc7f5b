pub mod client;
pub mod schema;

pub use client::{SqliteStore, SqliteTransaction};
pub use schema::ensure_schema;
