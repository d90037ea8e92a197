//! Server-side runtime state of one document.

use std::sync::Arc;

use crate::auth::ClientId;
use crate::broadcast::{BroadcastGroup, BroadcastStats, ClientSender};
use crate::protocol::Message;
use crate::storage::{DocumentStorage, Inbound, StorageError};

/// One document's connected clients and storage backend.
///
/// Created on the first subscription to a document and dropped after the
/// last client leaves.
pub struct Session {
    id: String,
    name: String,
    encrypted: bool,
    clients: BroadcastGroup,
    storage: Arc<dyn DocumentStorage>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        encrypted: bool,
        storage: Arc<dyn DocumentStorage>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            encrypted,
            clients: BroadcastGroup::new(),
            storage,
        }
    }

    /// Storage key of the document.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Document name as it appears on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Join a client to the session. Returns `false` if it was already in.
    pub async fn add_client(&self, id: ClientId, sender: ClientSender) -> bool {
        let added = self.clients.add_client(id, sender).await;
        if added {
            log::debug!("Client {id} joined session {}", self.id);
        }
        added
    }

    /// Remove a client. Returns `true` when the session is now empty.
    pub async fn remove_client(&self, id: &ClientId) -> bool {
        if self.clients.remove_client(id).await.is_some() {
            log::debug!("Client {id} left session {}", self.id);
        }
        self.clients.client_count().await == 0
    }

    /// Sender of a client in this session.
    pub async fn client(&self, id: &ClientId) -> Option<ClientSender> {
        self.clients.client(id).await
    }

    /// Whether `id` is in this session.
    pub async fn has_client(&self, id: &ClientId) -> bool {
        self.clients.has_client(id).await
    }

    /// Number of clients in this session.
    pub async fn client_count(&self) -> usize {
        self.clients.client_count().await
    }

    /// Whether the last client has left.
    pub async fn is_empty(&self) -> bool {
        self.client_count().await == 0
    }

    /// Fan `message` out to the session's clients.
    ///
    /// Payload-carrying messages skip `origin`; control messages reach it too.
    pub async fn broadcast(&self, message: &Message, origin: ClientId) -> usize {
        let exclude = message.excludes_origin().then_some(origin);
        let encoded = Arc::new(message.encode().into_vec());
        self.clients.broadcast_raw(encoded, exclude).await
    }

    /// Send `message` to one client of this session.
    pub async fn send_to(&self, client: ClientId, message: &Message) -> Result<(), StorageError> {
        let encoded = Arc::new(message.encode().into_vec());
        if !self.clients.has_client(&client).await {
            return Err(StorageError::ClientNotFound(client));
        }
        if !self.clients.send_raw(&client, encoded).await {
            log::debug!("Client {client} disconnected before reply on {}", self.id);
        }
        Ok(())
    }

    /// Hand an inbound message to the storage backend.
    pub async fn handle(&self, inbound: &Inbound) -> Result<(), StorageError> {
        self.storage.on_message(inbound, self).await
    }

    /// Run the backend's unload hook.
    pub async fn unload(&self) -> Result<(), StorageError> {
        log::debug!("Unloading session {}", self.id);
        self.storage.on_unload(self).await
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.clients.stats().await
    }
}
