//! Pluggable document storage.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  on_message   ┌──────────────────────┐
//! │ Session     │ ────────────► │ DocumentStorage      │
//! │ (per doc)   │ ◄──────────── │ plain | zero-knowl.  │
//! └─────────────┘   broadcast   └──────────┬───────────┘
//!                   / send_to              │ with_lock
//!                                          ▼
//!                               ┌──────────────────────┐
//!                               │ KeyValueStore        │
//!                               │ memory | RocksDB     │
//!                               └──────────────────────┘
//! ```
//!
//! Backends decide how a document's messages are persisted and answered. The
//! plain backend merges CRDT updates; the zero-knowledge backend only ever
//! appends opaque encrypted records.

pub mod kv;
pub mod lock;
pub mod plain;
pub mod rocks;
pub mod zero_knowledge;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::ClientId;
use crate::protocol::{MalformedMessageError, Message};
use crate::session::Session;

pub use kv::{KeyValueStore, LockMeta, MemoryStore};
pub use lock::{DocumentLock, LockConfig, LockGuard};
pub use plain::PlainDocumentStorage;
pub use rocks::{RocksStore, StoreConfig};
pub use zero_knowledge::ZeroKnowledgeStorage;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A zero-knowledge document received a plaintext document message
    #[error("unencrypted message rejected for document {document}")]
    UnencryptedMessageRejected { document: String },
    /// A reply targets a client the session does not know
    #[error("client {0} not found in session")]
    ClientNotFound(ClientId),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("crdt error: {0}")]
    Crdt(String),
    #[error(transparent)]
    Protocol(#[from] MalformedMessageError),
}

/// A decoded message together with the client it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message: Message,
    pub origin: ClientId,
}

impl Inbound {
    pub fn new(message: Message, origin: ClientId) -> Self {
        Self { message, origin }
    }
}

/// Per-document storage backend.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Persist and answer one inbound message.
    async fn on_message(&self, inbound: &Inbound, session: &Session) -> Result<(), StorageError>;

    /// Called once when the last client has left the session.
    async fn on_unload(&self, _session: &Session) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Chooses the backend for a newly created session.
pub trait StorageFactory: Send + Sync {
    fn storage_for(&self, document: &str, encrypted: bool) -> Arc<dyn DocumentStorage>;
}

/// Zero-knowledge storage for encrypted documents, plain storage otherwise.
///
/// Both backends share one key-value store and one lock manager.
pub struct StorageRouter {
    plain: Arc<PlainDocumentStorage>,
    zero_knowledge: Arc<ZeroKnowledgeStorage>,
}

impl StorageRouter {
    pub fn new(store: Arc<dyn KeyValueStore>, lock_config: LockConfig) -> Self {
        let lock = Arc::new(DocumentLock::new(store.clone(), lock_config));
        Self {
            plain: Arc::new(PlainDocumentStorage::new(store.clone(), lock.clone())),
            zero_knowledge: Arc::new(ZeroKnowledgeStorage::new(store, lock)),
        }
    }

    /// In-memory storage with default lock timing.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), LockConfig::default())
    }
}

impl StorageFactory for StorageRouter {
    fn storage_for(&self, document: &str, encrypted: bool) -> Arc<dyn DocumentStorage> {
        if encrypted {
            log::debug!("Using zero-knowledge storage for {document}");
            self.zero_knowledge.clone()
        } else {
            log::debug!("Using plain storage for {document}");
            self.plain.clone()
        }
    }
}
