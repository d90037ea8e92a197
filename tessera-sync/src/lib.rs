//! # tessera-sync: Real-time document synchronization
//!
//! Clients keep a local CRDT replica and exchange binary deltas with a
//! server over one persistent connection. The server routes each document
//! to a session with a lock-guarded storage backend; encrypted documents use
//! a zero-knowledge backend that never looks inside updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Provider    │ ◄─────────────────► │ Server      │
//! │ (per doc)   │     Binary Proto    │ (registry)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Yrs Doc     │                     │ Session     │
//! │ (local)     │                     │ (per doc)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                               ┌────────────┴────────────┐
//!                               │ Plain / ZeroKnowledge   │
//!                               │ storage + DocumentLock  │
//!                               └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol and faux update lists
//! - [`storage`]: Key-value stores, document lock, storage backends
//! - [`broadcast`]: Per-session fan-out
//! - [`session`]: Server-side state of one document
//! - [`server`]: Session registry and WebSocket accept loop
//! - [`auth`]: Client identity, session context, permission checks
//! - [`subscription`]: `documents=a,b:encrypted` resolution
//! - [`client`]: Connection, providers, replicas, awareness, encryption

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod subscription;

// Re-exports for convenience
pub use auth::{AllowAll, ClientContext, ClientId, PermissionCheck, PermissionOutcome, SessionContext};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{
    Connection, ConnectionConfig, ConnectionError, ConnectionState, DestroyOptions, DocumentKey,
    Provider, ProviderError, ProviderEvent, ProviderManager, ProviderOptions, ProviderStatus,
    Replica, SubdocsEvent,
};
pub use protocol::{
    AwarenessStep, BinaryMessage, DocStep, FauxStateVector, FauxUpdate, FauxUpdateList,
    MalformedMessageError, Message, Payload, Permission,
};
pub use server::{ConnectInfo, Peer, Server, ServerConfig, ServerError, ServerStats};
pub use session::Session;
pub use storage::{
    DocumentLock, DocumentStorage, Inbound, KeyValueStore, LockConfig, MemoryStore,
    PlainDocumentStorage, RocksStore, StorageError, StorageFactory, StorageRouter, StoreConfig,
    ZeroKnowledgeStorage,
};
pub use subscription::{documents_from_query, parse_document_subscriptions, DocumentSubscription};
