//! Client-side provider: binds one local replica to a shared connection.
//!
//! ## Lifecycle
//!
//! ```text
//! created ──connect──▶ syncing ──sync-done──▶ synced
//!                         ▲                     │
//!                         └─────disconnect──────┘
//! ```
//!
//! Every (re)connect sends a fresh `sync-step-1`. Encrypted documents use
//! faux update lists: each outbound update becomes one sealed record with a
//! fresh message id, and the newest message id received doubles as the
//! state vector.
//!
//! Subdocuments are child providers on the same connection, named
//! `parent/sub_key`, and are destroyed with their parent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::awareness::{Awareness, AwarenessError, AwarenessUpdate};
use super::connection::{raised, Connection, ConnectionError, ConnectionState};
use super::crypto::{CryptoError, DocumentKey};
use super::replica::{Replica, ReplicaError, ReplicaSubscription, SubdocsEvent};
use crate::protocol::{
    AwarenessStep, DocStep, FauxStateVector, FauxUpdate, FauxUpdateList, MalformedMessageError,
    Message, Payload, Permission,
};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("awareness error: {0}")]
    Awareness(#[from] AwarenessError),
    #[error("protocol error: {0}")]
    Protocol(#[from] MalformedMessageError),
    #[error("provider destroyed")]
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Created,
    Syncing,
    Synced,
}

/// Notifications emitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Synced,
    AccessDenied { reason: String },
    AwarenessChanged { client: Uuid },
    SubdocLoaded { key: String, document: String },
    SubdocsUpdated { loaded: Vec<String>, removed: Vec<String> },
}

/// Provider options.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Key of an encrypted document; `None` for plain documents
    pub key: Option<DocumentKey>,
    /// Awareness identity (default: random)
    pub client_id: Uuid,
    /// Buffered events per subscriber (default: 64)
    pub event_capacity: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            key: None,
            client_id: Uuid::new_v4(),
            event_capacity: 64,
        }
    }
}

impl ProviderOptions {
    pub fn encrypted(key: DocumentKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Also tear down the shared connection
    pub close_connection: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ProviderInner<R: Replica> {
    document: String,
    replica: Arc<R>,
    connection: Connection,
    options: ProviderOptions,
    status: watch::Sender<ProviderStatus>,
    destroyed: watch::Sender<bool>,
    events: broadcast::Sender<ProviderEvent>,
    awareness: Mutex<Awareness>,
    /// Newest faux message id applied (encrypted documents)
    last_message_id: Mutex<Option<String>>,
    subdocs: Mutex<HashMap<String, Provider<R>>>,
    subdoc_subscription: Mutex<Option<ReplicaSubscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one replica in sync with its server-side document.
pub struct Provider<R: Replica> {
    inner: Arc<ProviderInner<R>>,
}

impl<R: Replica> Clone for Provider<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Replica> Provider<R> {
    /// Start syncing `replica` as `document` over `connection`.
    pub fn new(
        document: impl Into<String>,
        replica: Arc<R>,
        connection: Connection,
        options: ProviderOptions,
    ) -> Self {
        let document = document.into();
        let (status, _) = watch::channel(ProviderStatus::Created);
        let (destroyed, _) = watch::channel(false);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        let inner = Arc::new(ProviderInner {
            awareness: Mutex::new(Awareness::new(options.client_id)),
            document,
            replica,
            connection,
            options,
            status,
            destroyed,
            events,
            last_message_id: Mutex::new(None),
            subdocs: Mutex::new(HashMap::new()),
            subdoc_subscription: Mutex::new(None),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.replica.observe_subdocs(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                Provider { inner }.load_subdocs(event);
            }
        }));
        *lock(&inner.subdoc_subscription) = subscription;

        // Attach the reader before the first sync-step-1 goes out
        let frames = inner.connection.subscribe();
        let task = tokio::spawn(pump(inner.clone(), frames));
        *lock(&inner.task) = Some(task);

        log::debug!(
            "Provider for {} created ({})",
            inner.document,
            if inner.options.is_encrypted() { "encrypted" } else { "plain" }
        );
        Self { inner }
    }

    pub fn document(&self) -> &str {
        &self.inner.document
    }

    pub fn replica(&self) -> &Arc<R> {
        &self.inner.replica
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.options.is_encrypted()
    }

    pub fn status(&self) -> ProviderStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ProviderStatus> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.borrow()
    }

    /// Newest faux message id applied locally (encrypted documents only).
    pub fn last_message_id(&self) -> Option<String> {
        lock(&self.inner.last_message_id).clone()
    }

    /// Resolves once the handshake of the current connection has finished.
    pub async fn synced(&self) -> Result<(), ProviderError> {
        let mut status = self.inner.status.subscribe();
        let mut destroyed = self.inner.destroyed.subscribe();
        tokio::select! {
            result = async { status.wait_for(|s| *s == ProviderStatus::Synced).await.map(|_| ()) } => {
                result.map_err(|_| ProviderError::Destroyed)
            }
            _ = raised(&mut destroyed) => Err(ProviderError::Destroyed),
        }
    }

    /// Mutate the replica and send the resulting update.
    pub async fn edit<F, T>(&self, f: F) -> Result<T, ProviderError>
    where
        F: FnOnce(&R) -> T,
    {
        if self.is_destroyed() {
            return Err(ProviderError::Destroyed);
        }
        let before = self.inner.replica.state_vector();
        let output = f(&self.inner.replica);
        let update = self.inner.replica.diff(&before)?;
        self.inner.send_update(update).await?;
        Ok(output)
    }

    /// Publish the local awareness state; `None` announces departure.
    pub async fn set_awareness(&self, state: Option<Vec<u8>>) -> Result<(), ProviderError> {
        let update = lock(&self.inner.awareness).set_local_state(state);
        self.inner.send_awareness(&update).await
    }

    pub fn local_awareness(&self) -> Option<Vec<u8>> {
        lock(&self.inner.awareness).local_state().map(<[u8]>::to_vec)
    }

    /// Remote awareness states by client.
    pub fn awareness_states(&self) -> HashMap<Uuid, Vec<u8>> {
        lock(&self.inner.awareness)
            .peers()
            .iter()
            .map(|(id, peer)| (*id, peer.state.clone()))
            .collect()
    }

    /// Ask every peer to re-send its awareness state.
    pub async fn request_awareness(&self) -> Result<(), ProviderError> {
        let message = Message::awareness_request(&self.inner.document, self.is_encrypted());
        self.inner.send(&message).await
    }

    /// Open another document on the same connection.
    pub fn open_document(
        &self,
        document: impl Into<String>,
        replica: Arc<R>,
        options: ProviderOptions,
    ) -> Provider<R> {
        Provider::new(document, replica, self.inner.connection.clone(), options)
    }

    /// Destroy this provider, keeping the connection, and open `document`.
    pub async fn switch_document(
        &self,
        document: impl Into<String>,
        replica: Arc<R>,
        options: ProviderOptions,
    ) -> Provider<R> {
        let document = document.into();
        log::info!("Switching {} -> {document}", self.inner.document);
        self.destroy(DestroyOptions::default()).await;
        self.open_document(document, replica, options)
    }

    /// Start or stop child providers for discovered subdocuments.
    pub fn load_subdocs(&self, event: SubdocsEvent<R>) {
        if self.is_destroyed() {
            log::warn!("Ignoring subdocs of destroyed provider {}", self.inner.document);
            return;
        }

        let mut loaded = Vec::new();
        let mut removed = Vec::new();
        {
            let mut subdocs = lock(&self.inner.subdocs);
            for key in event.removed {
                if let Some(child) = subdocs.remove(&key) {
                    child.inner.teardown();
                    removed.push(key);
                }
            }
            for (key, replica) in event.loaded {
                if subdocs.contains_key(&key) {
                    log::warn!("Subdocument {key} of {} already loaded", self.inner.document);
                    continue;
                }
                let document = format!("{}/{}", self.inner.document, key);
                let child = Provider::new(
                    document.clone(),
                    replica,
                    self.inner.connection.clone(),
                    ProviderOptions {
                        client_id: Uuid::new_v4(),
                        ..self.inner.options.clone()
                    },
                );
                subdocs.insert(key.clone(), child);
                let _ = self.inner.events.send(ProviderEvent::SubdocLoaded {
                    key: key.clone(),
                    document,
                });
                loaded.push(key);
            }
        }

        if !loaded.is_empty() || !removed.is_empty() {
            let _ = self
                .inner
                .events
                .send(ProviderEvent::SubdocsUpdated { loaded, removed });
        }
    }

    pub fn subdoc(&self, key: &str) -> Option<Provider<R>> {
        lock(&self.inner.subdocs).get(key).cloned()
    }

    pub fn subdoc_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.subdocs).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop syncing. Subdocument providers go down with this one.
    pub async fn destroy(&self, options: DestroyOptions) {
        if self.is_destroyed() {
            return;
        }
        if self.local_awareness().is_some() && !options.close_connection {
            if let Err(e) = self.set_awareness(None).await {
                log::debug!("Awareness leave for {} not sent: {e}", self.inner.document);
            }
        }
        self.inner.teardown();
        if options.close_connection {
            self.inner.connection.destroy();
        }
    }
}

impl<R: Replica> ProviderInner<R> {
    fn is_encrypted(&self) -> bool {
        self.options.is_encrypted()
    }

    fn teardown(&self) {
        if self.destroyed.send_replace(true) {
            return;
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.subdoc_subscription).take();
        let children: Vec<Provider<R>> = lock(&self.subdocs).drain().map(|(_, p)| p).collect();
        for child in children {
            child.inner.teardown();
        }
        log::debug!("Provider for {} destroyed", self.document);
    }

    fn set_status(&self, status: ProviderStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn send(&self, message: &Message) -> Result<(), ProviderError> {
        self.connection.send(message.encode().into_vec()).await?;
        Ok(())
    }

    async fn send_update(&self, update: Vec<u8>) -> Result<(), ProviderError> {
        let payload = match &self.options.key {
            Some(key) => {
                let record = FauxUpdate::with_random_id(key.seal(&update)?);
                FauxUpdateList::new(vec![record]).encode()
            }
            None => update,
        };
        self.send(&Message::update(&self.document, self.is_encrypted(), payload))
            .await
    }

    async fn send_awareness(&self, update: &AwarenessUpdate) -> Result<(), ProviderError> {
        let mut bytes = update.encode()?;
        if let Some(key) = &self.options.key {
            bytes = key.seal(&bytes)?;
        }
        self.send(&Message::awareness_update(&self.document, self.is_encrypted(), bytes))
            .await
    }

    /// Open a handshake on a fresh link.
    async fn begin_sync(&self) -> Result<(), ProviderError> {
        self.set_status(ProviderStatus::Syncing);
        let state_vector = if self.is_encrypted() {
            FauxStateVector::new(lock(&self.last_message_id).clone()).encode()
        } else {
            self.replica.state_vector()
        };
        self.send(&Message::sync_step1(&self.document, self.is_encrypted(), state_vector))
            .await?;

        let local = lock(&self.awareness).local_update();
        if local.state.is_some() {
            self.send_awareness(&local).await?;
        }
        Ok(())
    }

    async fn handle_frame(&self, bytes: &[u8]) -> Result<(), ProviderError> {
        let message = Message::decode(bytes)?;
        if message.document != self.document {
            return Ok(());
        }

        match message.payload {
            Payload::Doc(DocStep::SyncStep1(state_vector)) => {
                if self.is_encrypted() {
                    log::trace!("Ignoring sync-step-1 on encrypted {}", self.document);
                    return Ok(());
                }
                let diff = self.replica.diff(&state_vector)?;
                self.send(&Message::sync_step2(&self.document, false, diff)).await
            }
            Payload::Doc(DocStep::SyncStep2(update)) | Payload::Doc(DocStep::Update(update)) => {
                self.apply_remote(&update)
            }
            Payload::Doc(DocStep::SyncDone) => {
                if *self.status.borrow() != ProviderStatus::Synced {
                    log::debug!("Provider for {} synced", self.document);
                    self.set_status(ProviderStatus::Synced);
                    let _ = self.events.send(ProviderEvent::Synced);
                }
                Ok(())
            }
            Payload::Doc(DocStep::Auth { permission, reason }) => {
                if permission == Permission::Denied {
                    log::warn!("Access to {} denied: {reason}", self.document);
                    let _ = self.events.send(ProviderEvent::AccessDenied { reason });
                }
                Ok(())
            }
            Payload::Awareness(AwarenessStep::Update(bytes)) => {
                let bytes = match &self.options.key {
                    Some(key) => key.open(&bytes)?,
                    None => bytes,
                };
                let update = AwarenessUpdate::decode(&bytes)?;
                let client = update.client;
                if lock(&self.awareness).apply(update) {
                    let _ = self.events.send(ProviderEvent::AwarenessChanged { client });
                }
                Ok(())
            }
            Payload::Awareness(AwarenessStep::Request) => {
                let local = lock(&self.awareness).local_update();
                if local.state.is_none() {
                    return Ok(());
                }
                self.send_awareness(&local).await
            }
        }
    }

    fn apply_remote(&self, update: &[u8]) -> Result<(), ProviderError> {
        let Some(key) = &self.options.key else {
            return Ok(self.replica.apply_update(update)?);
        };

        let records = FauxUpdateList::decode(update)?;
        for record in records.records() {
            match key.open(&record.update) {
                Ok(plain) => self.replica.apply_update(&plain)?,
                Err(e) => log::warn!(
                    "Skipping record {} of {}: {e}",
                    record.message_id,
                    self.document
                ),
            }
        }
        if let Some(id) = records.last_message_id() {
            *lock(&self.last_message_id) = Some(id.to_string());
        }
        Ok(())
    }
}

/// Connection → replica, and a fresh handshake on every connect.
async fn pump<R: Replica>(
    inner: Arc<ProviderInner<R>>,
    mut frames: broadcast::Receiver<Arc<Vec<u8>>>,
) {
    let mut states = inner.connection.watch_state();
    let mut destroyed = inner.destroyed.subscribe();

    if *states.borrow_and_update() == ConnectionState::Connected {
        if let Err(e) = inner.begin_sync().await {
            log::warn!("Handshake for {} failed: {e}", inner.document);
        }
    }

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == ConnectionState::Connected {
                    if let Err(e) = inner.begin_sync().await {
                        log::warn!("Handshake for {} failed: {e}", inner.document);
                    }
                } else if *inner.status.borrow() == ProviderStatus::Synced {
                    inner.set_status(ProviderStatus::Syncing);
                }
            }
            frame = frames.recv() => match frame {
                Ok(bytes) => {
                    if let Err(e) = inner.handle_frame(&bytes).await {
                        log::warn!("Dropping frame for {}: {e}", inner.document);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Provider for {} lagged {skipped} frames, resyncing", inner.document);
                    if let Err(e) = inner.begin_sync().await {
                        log::warn!("Handshake for {} failed: {e}", inner.document);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = raised(&mut destroyed) => break,
        }
    }

    if *inner.status.borrow() == ProviderStatus::Synced {
        inner.set_status(ProviderStatus::Syncing);
    }
}
