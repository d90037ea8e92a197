//! Ephemeral presence state shared between the clients of a document.
//!
//! Each client owns one opaque state blob and a clock. Updates with a
//! newer clock replace older ones; a `None` state means the client left.
//! Nothing here is ever persisted by the server.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("awareness encode failed: {0}")]
    Encode(String),
    #[error("awareness decode failed: {0}")]
    Decode(String),
}

/// One client's presence, as carried by an awareness-update message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client: Uuid,
    pub clock: u64,
    /// `None` once the client has left.
    pub state: Option<Vec<u8>>,
}

impl AwarenessUpdate {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::Decode(e.to_string()))?;
        Ok(update)
    }
}

/// A remote client's last known presence.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub clock: u64,
    pub state: Vec<u8>,
    last_seen: Instant,
}

impl RemoteState {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Local and remote presence of one document.
pub struct Awareness {
    client: Uuid,
    clock: u64,
    local: Option<Vec<u8>>,
    peers: HashMap<Uuid, RemoteState>,
}

impl Awareness {
    pub fn new(client: Uuid) -> Self {
        Self {
            client,
            clock: 0,
            local: None,
            peers: HashMap::new(),
        }
    }

    pub fn client(&self) -> Uuid {
        self.client
    }

    pub fn local_state(&self) -> Option<&[u8]> {
        self.local.as_deref()
    }

    /// Replace the local state and return the update to publish.
    pub fn set_local_state(&mut self, state: Option<Vec<u8>>) -> AwarenessUpdate {
        self.clock += 1;
        self.local = state;
        self.local_update()
    }

    /// The current local state as an update, e.g. to answer a request.
    pub fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            client: self.client,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Apply a peer's update. Returns `true` if anything changed.
    pub fn apply(&mut self, update: AwarenessUpdate) -> bool {
        if update.client == self.client {
            return false;
        }
        if let Some(known) = self.peers.get(&update.client) {
            if update.clock <= known.clock {
                return false;
            }
        }

        match update.state {
            Some(state) => {
                self.peers.insert(
                    update.client,
                    RemoteState {
                        clock: update.clock,
                        state,
                        last_seen: Instant::now(),
                    },
                );
            }
            None => {
                if self.peers.remove(&update.client).is_none() {
                    return false;
                }
            }
        }
        true
    }

    pub fn peer(&self, client: &Uuid) -> Option<&RemoteState> {
        self.peers.get(client)
    }

    pub fn peers(&self) -> &HashMap<Uuid, RemoteState> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forget peers silent for longer than `timeout`.
    pub fn cleanup_idle_peers(&mut self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
