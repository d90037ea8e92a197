//! Session registry and WebSocket transport.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Session (doc id) ── DocumentStorage
//!             ├── Peer ── Server ───┤          │                 │
//! Client B ──┘                      │          │                 ├── KeyValueStore
//!                                   │          │                 └── DocumentLock
//!                                   └── Session ...
//!                                              │
//!                                   ┌──────────┼───────────┐
//!                                   ▼          ▼           ▼
//!                                Client A   Client B    Client C
//! ```
//!
//! A peer is one client transport. It subscribes to documents either up
//! front (query string) or implicitly with its first message for a
//! document. Sessions live exactly as long as they have clients.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::auth::{AllowAll, ClientId, PermissionCheck, SessionContext};
use crate::broadcast::ClientSender;
use crate::protocol::{Message, Permission};
use crate::session::Session;
use crate::storage::{
    Inbound, KeyValueStore, LockConfig, MemoryStore, RocksStore, StorageError, StorageFactory,
    StorageRouter, StoreConfig,
};
use crate::subscription::documents_from_query;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Consecutive undecodable frames after which a client is disconnected
    pub max_malformed_messages: u32,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Document lock timing
    pub lock: LockConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_malformed_messages: 16,
            storage_path: None,
            lock: LockConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_malformed_messages: 3,
            storage_path: None,
            lock: LockConfig::for_testing(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub denied_subscriptions: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("permission denied for {document}: {reason}")]
    PermissionDenied { document: String, reason: String },
    #[error("client {client} sent {count} malformed messages in a row")]
    CorruptClient { client: ClientId, count: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ServerError {
    /// Whether the transport should be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::CorruptClient { .. })
    }
}

/// What the host knows about an incoming transport.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub addr: SocketAddr,
    pub path: String,
    pub query: String,
}

/// One client transport attached to the server.
pub struct Peer<C: SessionContext> {
    context: C,
    sender: ClientSender,
    /// Document ids this peer is subscribed to
    subscriptions: HashSet<String>,
    malformed_streak: u32,
}

impl<C: SessionContext> Peer<C> {
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn client_id(&self) -> ClientId {
        self.context.client_id()
    }

    pub fn is_subscribed(&self, document: &str) -> bool {
        self.subscriptions.contains(&self.context.document_id(document))
    }
}

/// The document session registry.
pub struct Server<C: SessionContext> {
    config: ServerConfig,
    /// Sessions keyed by document id
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    storage: Arc<dyn StorageFactory>,
    permissions: Arc<dyn PermissionCheck<C>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<C: SessionContext> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            storage: self.storage.clone(),
            permissions: self.permissions.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<C: SessionContext> Server<C> {
    /// Create a server whose storage follows `config.storage_path`.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let storage = Arc::new(StorageRouter::new(store, config.lock.clone()));
        Ok(Self::with_storage(config, storage))
    }

    /// Create with an explicit storage factory.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn StorageFactory>) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage,
            permissions: Arc::new(AllowAll),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Replace the permission collaborator.
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionCheck<C>>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ─── Registry ─────────────────────────────────────────────────────

    /// Subscribe a client to `document`.
    ///
    /// The permission check runs first. A denied client gets an auth message
    /// and is never added to a session.
    pub async fn subscribe(
        &self,
        context: &C,
        document: &str,
        encrypted: bool,
        sender: ClientSender,
    ) -> Result<Arc<Session>, ServerError> {
        let client = context.client_id();
        let outcome = self.permissions.check_permission(context, document).await;
        if !outcome.is_granted() {
            log::info!("Client {client} denied access to {document}: {}", outcome.reason);
            let denial = Message::auth(document, encrypted, Permission::Denied, outcome.reason.clone());
            if sender.send(Arc::new(denial.encode().into_vec())).is_err() {
                log::debug!("Client {client} disconnected before denial for {document}");
            }
            self.stats.write().await.denied_subscriptions += 1;
            return Err(ServerError::PermissionDenied {
                document: document.to_string(),
                reason: outcome.reason,
            });
        }

        let id = context.document_id(document);
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| {
                log::info!("Opening session {id} ({})", if encrypted { "encrypted" } else { "plain" });
                Arc::new(Session::new(
                    id.clone(),
                    document,
                    encrypted,
                    self.storage.storage_for(document, encrypted),
                ))
            })
            .clone();
        session.add_client(client, sender).await;
        let active = sessions.len();
        drop(sessions);

        self.stats.write().await.active_sessions = active;
        Ok(session)
    }

    /// Remove a client from a document. The session is unloaded and dropped
    /// once its last client has left.
    pub async fn unsubscribe(&self, client: ClientId, document_id: &str) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(document_id).cloned() else {
            return Ok(());
        };
        if !session.remove_client(&client).await {
            return Ok(());
        }

        let unloaded = session.unload().await;
        sessions.remove(document_id);
        let active = sessions.len();
        drop(sessions);

        log::info!("Closed session {document_id}");
        self.stats.write().await.active_sessions = active;
        unloaded.map_err(ServerError::from)
    }

    pub async fn session(&self, document_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Route one decoded message from `context` to its session.
    pub async fn handle_message(&self, context: &C, message: Message) -> Result<(), ServerError> {
        let id = context.document_id(&message.document);
        let Some(session) = self.session(&id).await else {
            log::debug!("Dropping message for {id}: no session");
            return Ok(());
        };
        session
            .handle(&Inbound::new(message, context.client_id()))
            .await
            .map_err(ServerError::from)
    }

    // ─── Peers ────────────────────────────────────────────────────────

    /// Attach a transport. Everything the server sends the peer arrives on
    /// the returned receiver.
    pub fn open_peer(&self, context: C) -> (Peer<C>, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (sender, outbound) = mpsc::unbounded_channel();
        let peer = Peer {
            context,
            sender,
            subscriptions: HashSet::new(),
            malformed_streak: 0,
        };
        (peer, outbound)
    }

    /// Subscribe a peer unless it already is.
    pub async fn subscribe_peer(
        &self,
        peer: &mut Peer<C>,
        document: &str,
        encrypted: bool,
    ) -> Result<(), ServerError> {
        let id = peer.context.document_id(document);
        if peer.subscriptions.contains(&id) {
            return Ok(());
        }
        self.subscribe(&peer.context, document, encrypted, peer.sender.clone())
            .await?;
        peer.subscriptions.insert(id);
        Ok(())
    }

    /// Decode and route one frame from a peer.
    ///
    /// Undecodable frames are dropped; after
    /// [`ServerConfig::max_malformed_messages`] in a row the peer is reported
    /// as corrupt.
    pub async fn receive(&self, peer: &mut Peer<C>, bytes: &[u8]) -> Result<(), ServerError> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        let message = match Message::decode(bytes) {
            Ok(message) => {
                peer.malformed_streak = 0;
                message
            }
            Err(e) => {
                peer.malformed_streak += 1;
                self.stats.write().await.malformed_messages += 1;
                log::warn!("Dropping frame from {}: {e}", peer.client_id());
                if peer.malformed_streak >= self.config.max_malformed_messages {
                    return Err(ServerError::CorruptClient {
                        client: peer.client_id(),
                        count: peer.malformed_streak,
                    });
                }
                return Ok(());
            }
        };

        match self
            .subscribe_peer(peer, &message.document, message.encrypted)
            .await
        {
            Ok(()) => {}
            // The client has been told
            Err(ServerError::PermissionDenied { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        self.handle_message(&peer.context, message).await
    }

    /// Detach a transport and leave every session it joined.
    pub async fn close_peer(&self, peer: &mut Peer<C>) {
        let client = peer.client_id();
        for id in peer.subscriptions.drain() {
            if let Err(e) = self.unsubscribe(client, &id).await {
                log::error!("Failed to unsubscribe {client} from {id}: {e}");
            }
        }
    }

    // ─── WebSocket transport ──────────────────────────────────────────

    /// Bind to the configured address and serve WebSocket clients.
    pub async fn run<F>(&self, make_context: F) -> Result<(), ServerError>
    where
        F: Fn(&ConnectInfo) -> C + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, make_context).await
    }

    /// Serve WebSocket clients accepted from `listener`.
    pub async fn serve<F>(&self, listener: TcpListener, make_context: F) -> Result<(), ServerError>
    where
        F: Fn(&ConnectInfo) -> C + Send + Sync + 'static,
    {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let make_context = Arc::new(make_context);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            let make_context = make_context.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr, make_context).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection<F>(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        make_context: Arc<F>,
    ) -> Result<(), ServerError>
    where
        F: Fn(&ConnectInfo) -> C + Send + Sync + 'static,
    {
        let mut target: Option<(String, String)> = None;
        let record_target = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri();
            target = Some((uri.path().to_string(), uri.query().unwrap_or_default().to_string()));
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, record_target).await?;

        let (path, query) = target.unwrap_or_default();
        let info = ConnectInfo { addr, path, query };
        let (mut peer, mut outbound) = self.open_peer((make_context.as_ref())(&info));
        log::info!("WebSocket connection established from {addr} as {}", peer.client_id());

        for subscription in documents_from_query(&info.query) {
            if let Err(e) = self
                .subscribe_peer(&mut peer, &subscription.document, subscription.encrypted)
                .await
            {
                log::warn!("Subscription to {} failed: {e}", subscription.document);
            }
        }

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match self.receive(&mut peer, &bytes).await {
                                Ok(()) => {}
                                Err(e) if e.is_fatal() => {
                                    log::warn!("Closing connection from {addr}: {e}");
                                    break Err(e);
                                }
                                Err(e) => log::warn!("Message from {addr} failed: {e}"),
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Err(e.into());
                        }

                        _ => {}
                    }
                }

                out = outbound.recv() => {
                    match out {
                        Some(data) => {
                            if let Err(e) = ws_sender.send(WsMessage::Binary(data.to_vec().into())).await {
                                break Err(e.into());
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        self.close_peer(&mut peer).await;
        let _ = ws_sender.close().await;

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}
