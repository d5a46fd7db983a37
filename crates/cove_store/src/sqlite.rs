//! SQLite-backed [`KvBackend`] via sqlx.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{backend::KvBackend, error::StoreError};

/// Durable backend over a single SQLite file. Cheap to clone (pool is Arc
/// internally).
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and ensure the schema.
    ///
    /// WAL journal mode is configured at connection time — SQLite forbids
    /// changing `journal_mode` inside a transaction.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                namespace  TEXT NOT NULL,
                k          TEXT NOT NULL,
                v          TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (namespace, k)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Schema(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT v FROM kv_entries WHERE namespace = ? AND k = ?")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_entries (namespace, k, v, updated_at)
             VALUES (?, ?, ?, datetime('now'))
             ON CONFLICT (namespace, k) DO UPDATE
             SET v = excluded.v, updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND k = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> Result<(), StoreError> {
        // Escape LIKE wildcards in the prefix so a literal '%' in a
        // conversation id cannot widen the delete.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        sqlx::query(
            "DELETE FROM kv_entries WHERE namespace = ? AND k LIKE ? ESCAPE '\\'",
        )
        .bind(namespace)
        .bind(format!("{escaped}%"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
