//! Client side: shared connection, providers and their replicas.
//!
//! ```text
//! ProviderManager ──▶ Provider ──▶ Replica (yrs::Doc)
//!                        │  ▲
//!                 edits  ▼  │ sync-step-2 / updates
//!                     Connection (one per server, shared)
//! ```

pub mod awareness;
pub mod connection;
pub mod crypto;
pub mod manager;
pub mod provider;
pub mod replica;

pub use awareness::{Awareness, AwarenessError, AwarenessUpdate, RemoteState};
pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionState, OfflineQueue, Transport,
};
pub use crypto::{CryptoError, DocumentKey};
pub use manager::ProviderManager;
pub use provider::{
    DestroyOptions, Provider, ProviderError, ProviderEvent, ProviderOptions, ProviderStatus,
};
pub use replica::{Replica, ReplicaError, ReplicaSubscription, SubdocsEvent};
