//! Durable state store
//!
//! Single embedded SQLite backend behind a sqlx pool: WAL journalling, busy
//! timeout, embedded migrations, schema version in `PRAGMA user_version`.
//! `memory` maps to an in-memory SQLite database for tests and ephemeral
//! deployments; any other backend name is refused at open.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use tracing::info;

pub mod capabilities;
pub mod leases;
pub mod resume;
pub mod sessions;

use crate::config::StorageConfig;
use crate::errors::StoreError;

/// Schema version the binary expects after migrations ran
const SCHEMA_VERSION: i64 = 1;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the configured backend, apply migrations, verify the schema
    /// version pragma.
    pub async fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        let options = match config.backend.as_str() {
            "sqlite" => {
                let path = config.database_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::CorruptedSchema {
                        detail: format!("cannot create data dir {}: {e}", parent.display()),
                    })?;
                }
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
            }
            "memory" => SqliteConnectOptions::new()
                .in_memory(true)
                .shared_cache(true),
            other => return Err(StoreError::UnsupportedBackend(other.to_string())),
        };

        let journal_mode = SqliteJournalMode::from_str(&config.sqlite.journal_mode)
            .map_err(|e| StoreError::CorruptedSchema {
                detail: format!("invalid journal mode: {e}"),
            })?;
        let synchronous = SqliteSynchronous::from_str(&config.sqlite.synchronous)
            .map_err(|e| StoreError::CorruptedSchema {
                detail: format!("invalid synchronous mode: {e}"),
            })?;

        let options = options
            .journal_mode(journal_mode)
            .synchronous(synchronous)
            .busy_timeout(config.sqlite.busy_timeout)
            .foreign_keys(true);

        // the in-memory database lives and dies with its connection
        let max_connections = if config.backend == "memory" { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        store.verify_schema_version().await?;
        info!(backend = %config.backend, "store opened");
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let mut config = StorageConfig::default();
        config.backend = "memory".to_string();
        Self::open(&config).await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn verify_schema_version(&self) -> Result<(), StoreError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if version != SCHEMA_VERSION {
            return Err(StoreError::CorruptedSchema {
                detail: format!("user_version {version}, expected {SCHEMA_VERSION}"),
            });
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_opens_and_migrates() {
        let store = Store::open_in_memory().await.unwrap();
        store.verify_schema_version().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_backend_is_refused() {
        let mut config = StorageConfig::default();
        config.backend = "bolt".to_string();
        let err = Store::open(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedBackend(name) if name == "bolt"));
    }

    #[tokio::test]
    async fn sqlite_backend_creates_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let _store = Store::open(&config).await.unwrap();
        assert!(dir.path().join("xg2g.sqlite").exists());
    }
}
