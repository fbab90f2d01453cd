//! Feature store handle.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

use foreman_core::db::{open_pool, open_pool_in_memory};
pub use foreman_core::db::DatabaseError;

/// Cheap-to-clone handle to the `SQLite` feature store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create the store at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(open_pool(path).await?).await
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!("Feature store migrations complete");
        Ok(Self { pool })
    }

    pub(super) const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn open_file_database_twice_reuses_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.db");
        drop(Database::open(&path).await.unwrap());
        let db = Database::open(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM features")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
