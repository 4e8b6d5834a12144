//! # nimbus-db
//!
//! SQLite persistence for the nimbus control plane: the connection pool and
//! the [`nimbus_core::CloudStore`] implementation.

pub mod pool;
pub mod store;

pub use pool::DbPool;
pub use store::SqliteStore;
