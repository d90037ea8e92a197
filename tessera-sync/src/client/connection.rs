//! Shared, reconnecting client transport.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with backoff, destroy)
//! - Concurrent senders funnelled into a single writer
//! - Any number of readers via a broadcast of inbound frames
//! - Offline queue for frames sent while disconnected
//!
//! Reference: Kleppmann, Chapter 5: Replication

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("offline queue full")]
    QueueFull,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL (`ws://` or `wss://`)
    pub url: String,
    /// First reconnect delay (default: 100ms)
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling (default: 5s)
    pub max_backoff: Duration,
    /// Give up after this many consecutive failures (default: never)
    pub max_reconnect_attempts: Option<u32>,
    /// Frames kept while disconnected (default: 10,000)
    pub offline_queue_size: usize,
    /// Inbound frames buffered per reader (default: 1024)
    pub incoming_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_reconnect_attempts: None,
            offline_queue_size: 10_000,
            incoming_capacity: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Fast reconnects for tests.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            max_reconnect_attempts: None,
            offline_queue_size: 1_000,
            incoming_capacity: 256,
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Offline queue for frames sent while disconnected.
///
/// Queued frames are replayed on reconnection, in order.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame. Returns `false` when full.
    pub fn enqueue(&mut self, frame: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ConnectionError>> + Send>>;

/// One established link: binary frames out, binary frames in.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Vec<u8>, Error = ConnectionError> + Send + 'static,
        R: Stream<Item = Result<Vec<u8>, ConnectionError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

type Dial = Arc<dyn Fn() -> BoxFuture<'static, Result<Transport, ConnectionError>> + Send + Sync>;

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    /// Writer channel of the live link, if any
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    offline: Mutex<OfflineQueue>,
    incoming: broadcast::Sender<Arc<Vec<u8>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Connection {} {:?} -> {state:?}", self.config.url, current);
            *current = state;
            true
        });
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Signals shutdown when the last [`Connection`] handle goes away.
struct ShutdownOnDrop(Arc<watch::Sender<bool>>);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// A multiplexed client connection. Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    _shutdown: Arc<ShutdownOnDrop>,
}

impl Connection {
    /// Connect to `config.url` over WebSocket.
    pub fn websocket(config: ConnectionConfig) -> Self {
        let url = config.url.clone();
        Self::with_dialer(config, move || {
            let url = url.clone();
            async move { dial_websocket(&url).await }
        })
    }

    /// Connect through a custom dialer, called again on every reconnect.
    pub fn with_dialer<F, Fut>(config: ConnectionConfig, dial: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Transport, ConnectionError>> + Send + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (incoming, _) = broadcast::channel(config.incoming_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let inner = Arc::new(Inner {
            offline: Mutex::new(OfflineQueue::new(config.offline_queue_size)),
            config,
            state,
            outgoing: Mutex::new(None),
            incoming,
            shutdown: shutdown.clone(),
        });

        let dial: Dial = Arc::new(move || Box::pin(dial()));
        tokio::spawn(drive(inner.clone(), dial));

        Self {
            inner,
            _shutdown: Arc::new(ShutdownOnDrop(shutdown)),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Resolves once the connection is `Connected`.
    pub async fn connected(&self) -> Result<(), ConnectionError> {
        let mut state = self.inner.state.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            result = async { state.wait_for(|s| *s == ConnectionState::Connected).await.map(|_| ()) } => {
                result.map_err(|_| ConnectionError::Closed)
            }
            _ = raised(&mut shutdown) => Err(ConnectionError::Closed),
        }
    }

    /// Attach a reader. It sees every frame received from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.inner.incoming.subscribe()
    }

    /// Send a frame, queueing it while disconnected.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed);
        }

        let outgoing = self.inner.outgoing.lock().await;
        let frame = match outgoing.as_ref() {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };

        let mut offline = self.inner.offline.lock().await;
        if offline.enqueue(frame) {
            log::trace!("Queued frame while disconnected ({} pending)", offline.len());
            Ok(())
        } else {
            Err(ConnectionError::QueueFull)
        }
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.inner.offline.lock().await.len()
    }

    /// Close the link and stop reconnecting.
    pub fn destroy(&self) {
        if !self.inner.shutdown.send_replace(true) {
            log::info!("Destroying connection to {}", self.inner.config.url);
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

/// Resolves once `flag` is raised or its sender is gone.
///
/// Wraps `wait_for` so no `watch::Ref` outlives the wait inside `select!`.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

/// Connect, pump frames until the link dies, back off, repeat.
async fn drive(inner: Arc<Inner>, dial: Dial) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut failures = 0u32;

    loop {
        if inner.is_shut_down() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let dialed = tokio::select! {
            result = (dial.as_ref())() => result,
            _ = raised(&mut shutdown) => break,
        };

        match dialed {
            Ok(transport) => {
                failures = 0;
                let reason = pump(&inner, transport, &mut shutdown).await;
                log::info!("Connection to {} ended: {reason}", inner.config.url);
            }
            Err(e) => {
                failures += 1;
                log::warn!("Connecting to {} failed: {e}", inner.config.url);
            }
        }
        inner.set_state(ConnectionState::Disconnected);

        if inner.is_shut_down() {
            break;
        }
        if let Some(max) = inner.config.max_reconnect_attempts {
            if failures >= max {
                log::error!("Giving up on {} after {failures} attempts", inner.config.url);
                inner.shutdown.send_replace(true);
                break;
            }
        }

        let delay = inner.config.backoff(failures.saturating_sub(1));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = raised(&mut shutdown) => break,
        }
    }

    inner.set_state(ConnectionState::Disconnected);
}

/// Run one established link. Returns why it ended.
async fn pump(
    inner: &Inner,
    transport: Transport,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let Transport { mut sink, mut stream } = transport;
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Replay and install the writer atomically so queued frames stay first
    {
        let mut outgoing = inner.outgoing.lock().await;
        let queued = inner.offline.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued frames", queued.len());
        }
        for frame in queued {
            let _ = tx.send(frame);
        }
        *outgoing = Some(tx);
    }
    inner.set_state(ConnectionState::Connected);

    let reason = loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break e.to_string();
                    }
                }
                None => break "writer closed".to_string(),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(frame)) => {
                    let _ = inner.incoming.send(Arc::new(frame));
                }
                Some(Err(e)) => break e.to_string(),
                None => break "closed by server".to_string(),
            },
            _ = raised(shutdown) => {
                let _ = sink.close().await;
                break "destroyed".to_string();
            }
        }
    };

    // Unsent frames go back to the offline queue
    let mut outgoing = inner.outgoing.lock().await;
    *outgoing = None;
    let mut offline = inner.offline.lock().await;
    let mut requeued = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        requeued.push(frame);
    }
    let pending = offline.drain();
    for frame in requeued.into_iter().chain(pending) {
        if !offline.enqueue(frame) {
            log::warn!("Offline queue full, dropping frame");
        }
    }

    reason
}

async fn dial_websocket(url: &str) -> Result<Transport, ConnectionError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ConnectionError::Dial(e.to_string()))?;
    let (writer, reader) = ws_stream.split();

    let sink = futures_util::sink::unfold(writer, |mut writer, frame: Vec<u8>| async move {
        writer
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        Ok::<_, ConnectionError>(writer)
    });

    let stream = futures_util::stream::unfold(reader, |mut reader| async move {
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let frame: Vec<u8> = data.into();
                    return Some((Ok(frame), reader));
                }
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some((Err(ConnectionError::Transport(e.to_string())), reader));
                }
            }
        }
    });

    Ok(Transport::new(sink, stream))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An in-memory link: what the client writes lands on `sent`, frames
    /// pushed into `inject` reach the client. Dropping `inject` closes it.
    pub struct Loopback {
        pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
        pub inject: mpsc::UnboundedSender<Vec<u8>>,
    }

    pub fn loopback() -> (Transport, Loopback) {
        let (sent_tx, sent) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inject, inject_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sink = futures_util::sink::unfold(sent_tx, |tx, frame: Vec<u8>| async move {
            tx.send(frame).map_err(|_| ConnectionError::Closed)?;
            Ok::<_, ConnectionError>(tx)
        });
        let stream = futures_util::stream::unfold(inject_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        });
        (Transport::new(sink, stream), Loopback { sent, inject })
    }

    /// A connection with exactly one loopback link.
    pub fn connected_pair() -> (Connection, Loopback) {
        let (link, remote) = loopback();
        let link = std::sync::Mutex::new(Some(link));
        let conn = Connection::with_dialer(ConnectionConfig::for_testing("mem"), move || {
            let next = link.lock().unwrap().take();
            async move { next.ok_or_else(|| ConnectionError::Dial("no more links".into())) }
        });
        (conn, remote)
    }

    /// A connection that dials whatever link is pushed into the returned
    /// sender, waiting until one arrives.
    pub fn redialing() -> (Connection, mpsc::UnboundedSender<Transport>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel::<Transport>();
        let links_rx = Arc::new(Mutex::new(links_rx));
        let conn = Connection::with_dialer(ConnectionConfig::for_testing("mem"), move || {
            let links_rx = links_rx.clone();
            async move {
                links_rx
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or_else(|| ConnectionError::Dial("closed".into()))
            }
        });
        (conn, links_tx)
    }
}
