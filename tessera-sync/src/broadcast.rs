//! Fan-out of encoded messages to the clients of one document.
//!
//! Each client owns one unbounded outbound channel shared by all its
//! sessions. A broadcast encodes once and sweeps every client, optionally
//! skipping the origin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::auth::ClientId;

/// Outbound half of a client's transport.
pub type ClientSender = mpsc::UnboundedSender<Arc<Vec<u8>>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_clients: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The connected clients of one document.
pub struct BroadcastGroup {
    clients: RwLock<HashMap<ClientId, ClientSender>>,
    atomic_stats: AtomicBroadcastStats,
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a client. Returns `false` if it was already present.
    pub async fn add_client(&self, id: ClientId, sender: ClientSender) -> bool {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, sender);
        true
    }

    /// Remove a client, handing back its sender if it was present.
    pub async fn remove_client(&self, id: &ClientId) -> Option<ClientSender> {
        self.clients.write().await.remove(id)
    }

    /// Sender of a client, if it is a member.
    pub async fn client(&self, id: &ClientId) -> Option<ClientSender> {
        self.clients.read().await.get(id).cloned()
    }

    /// Whether `id` is a member.
    pub async fn has_client(&self, id: &ClientId) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Number of members.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ids of all members, in no particular order.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Send pre-encoded bytes to every client except `exclude`.
    ///
    /// Returns the number of clients the message was handed to.
    pub async fn broadcast_raw(&self, encoded: Arc<Vec<u8>>, exclude: Option<ClientId>) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (id, sender) in clients.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if sender.send(encoded.clone()).is_ok() {
                delivered += 1;
            } else {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped broadcast to disconnected client {id}");
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Send pre-encoded bytes to one client. Returns `false` if it is unknown
    /// or its transport has gone away.
    pub async fn send_raw(&self, id: &ClientId, encoded: Arc<Vec<u8>>) -> bool {
        match self.clients.read().await.get(id) {
            Some(sender) => {
                let ok = sender.send(encoded).is_ok();
                if !ok {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                ok
            }
            None => false,
        }
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_clients: self.clients.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (ClientId, ClientSender, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientId::new(), tx, rx)
    }

    #[tokio::test]
    async fn test_add_remove() {
        let group = BroadcastGroup::new();
        let (id, tx, _rx) = client();

        assert!(group.add_client(id, tx.clone()).await);
        assert!(!group.add_client(id, tx).await);
        assert_eq!(group.client_count().await, 1);
        assert!(group.has_client(&id).await);

        assert!(group.remove_client(&id).await.is_some());
        assert_eq!(group.client_count().await, 0);
        assert!(group.remove_client(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let group = BroadcastGroup::new();
        let (a, tx_a, mut rx_a) = client();
        let (b, tx_b, mut rx_b) = client();
        let (c, tx_c, mut rx_c) = client();
        group.add_client(a, tx_a).await;
        group.add_client(b, tx_b).await;
        group.add_client(c, tx_c).await;

        let count = group.broadcast_raw(Arc::new(vec![1, 2, 3]), Some(a)).await;
        assert_eq!(count, 2);
        assert_eq!(*rx_b.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx_c.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_all() {
        let group = BroadcastGroup::new();
        let (a, tx_a, mut rx_a) = client();
        let (b, tx_b, mut rx_b) = client();
        group.add_client(a, tx_a).await;
        group.add_client(b, tx_b).await;

        assert_eq!(group.broadcast_raw(Arc::new(vec![9]), None).await, 2);
        assert_eq!(*rx_a.recv().await.unwrap(), vec![9]);
        assert_eq!(*rx_b.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_send_raw_targets_one_client() {
        let group = BroadcastGroup::new();
        let (a, tx_a, mut rx_a) = client();
        let (b, tx_b, mut rx_b) = client();
        group.add_client(a, tx_a).await;
        group.add_client(b, tx_b).await;

        assert!(group.send_raw(&b, Arc::new(vec![5])).await);
        assert_eq!(*rx_b.recv().await.unwrap(), vec![5]);
        assert!(rx_a.try_recv().is_err());
        assert!(!group.send_raw(&ClientId::new(), Arc::new(vec![5])).await);
    }

    #[tokio::test]
    async fn test_closed_receivers_count_as_dropped() {
        let group = BroadcastGroup::new();
        let (a, tx_a, rx_a) = client();
        let (b, tx_b, _rx_b) = client();
        group.add_client(a, tx_a).await;
        group.add_client(b, tx_b).await;
        drop(rx_a);

        assert_eq!(group.broadcast_raw(Arc::new(vec![1]), None).await, 1);
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_clients, 2);
    }
}
