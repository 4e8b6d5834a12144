//! Database connection pool.

use nimbus_core::{CloudError, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

/// SQLite connection pool wrapper.
#[derive(Debug, Clone)]
pub struct DbPool(SqlitePool);

impl DbPool {
    /// Connect to the database at the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url, "connecting to database");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| CloudError::Database(format!("failed to connect to {url}: {e}")))?;

        Ok(Self(pool))
    }

    /// An in-memory database for testing. Capped at one connection so every
    /// handle sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CloudError::Database(format!("failed to open in-memory db: {e}")))?;

        Ok(Self(pool))
    }

    pub fn inner(&self) -> &SqlitePool {
        &self.0
    }

    pub async fn close(&self) {
        self.0.close().await;
    }
}
