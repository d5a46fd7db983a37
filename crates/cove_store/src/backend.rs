//! Pluggable durable key-value backend.
//!
//! The stores in this crate are in-memory caches layered over one of these.
//! Production uses [`crate::sqlite::SqliteBackend`]; tests use
//! [`MemoryBackend`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    /// Idempotent upsert.
    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// Delete every key in `namespace` starting with `prefix`.
    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> Result<(), StoreError>;
}

/// Volatile backend for tests and ephemeral sessions.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_prefix(&self, namespace: &str, prefix: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.retain(|(ns, k), _| !(ns == namespace && k.starts_with(prefix)));
        Ok(())
    }
}
