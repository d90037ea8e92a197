//! Key-value layer underneath the document backends.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::StorageError;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-key lock record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    /// Expiry, milliseconds since epoch
    pub ttl: u64,
}

impl LockMeta {
    pub fn expiring_at(ttl: u64) -> Self {
        Self { ttl }
    }

    /// Milliseconds until expiry, zero when already expired.
    pub fn remaining(&self, now: u64) -> u64 {
        self.ttl.saturating_sub(now)
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.ttl > now
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Byte storage with a small metadata record per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set_item(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    async fn get_meta(&self, key: &str) -> Result<Option<LockMeta>, StorageError>;

    async fn set_meta(&self, key: &str, meta: LockMeta) -> Result<(), StorageError>;
}

/// In-process store. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<String, Vec<u8>>>,
    meta: RwLock<HashMap<String, LockMeta>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.items.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.write().await.remove(key);
        self.meta.write().await.remove(key);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<LockMeta>, StorageError> {
        Ok(self.meta.read().await.get(key).copied())
    }

    async fn set_meta(&self, key: &str, meta: LockMeta) -> Result<(), StorageError> {
        self.meta.write().await.insert(key.to_string(), meta);
        Ok(())
    }
}
