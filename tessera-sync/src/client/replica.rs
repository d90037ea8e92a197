//! The local CRDT replica a provider keeps in sync.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("invalid state vector: {0}")]
    StateVector(String),
    #[error("invalid update: {0}")]
    Update(String),
}

/// Subdocuments loaded into or removed from a replica, by the map key that
/// holds them.
pub struct SubdocsEvent<R> {
    pub loaded: Vec<(String, Arc<R>)>,
    pub removed: Vec<String>,
}

impl<R> Default for SubdocsEvent<R> {
    fn default() -> Self {
        Self {
            loaded: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<R> SubdocsEvent<R> {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.removed.is_empty()
    }
}

/// Keeps an observer registered until dropped.
pub type ReplicaSubscription = Box<dyn Any + Send + Sync>;

/// Callback fired with the subdocuments a committed change loaded or removed.
pub type SubdocsCallback<R> = Box<dyn Fn(SubdocsEvent<R>) + Send + Sync>;

/// Minimal replica surface the sync protocol needs.
///
/// An empty state vector stands for "knows nothing".
pub trait Replica: Send + Sync + 'static {
    /// Encoded state vector of the replica.
    fn state_vector(&self) -> Vec<u8>;

    /// Update carrying everything `state_vector` does not cover.
    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError>;

    fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError>;

    /// Full state as one update.
    fn snapshot(&self) -> Vec<u8> {
        // An empty state vector always decodes
        self.diff(&[]).unwrap_or_default()
    }

    /// Watch for nested subdocuments. Replicas without them return `None`.
    fn observe_subdocs(&self, _callback: SubdocsCallback<Self>) -> Option<ReplicaSubscription>
    where
        Self: Sized,
    {
        None
    }
}

fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, ReplicaError> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    StateVector::decode_v1(bytes).map_err(|e| ReplicaError::StateVector(e.to_string()))
}

impl Replica for Doc {
    fn state_vector(&self) -> Vec<u8> {
        self.transact().state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = decode_state_vector(state_vector)?;
        Ok(self.transact().encode_diff_v1(&remote))
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Update(e.to_string()))?;
        self.transact_mut()
            .apply_update(update)
            .map_err(|e| ReplicaError::Update(e.to_string()))
    }

    fn observe_subdocs(&self, callback: SubdocsCallback<Self>) -> Option<ReplicaSubscription> {
        // Removed subdocuments are gone from their map, so remember where
        // each loaded one lived.
        let keys: Mutex<HashMap<yrs::Uuid, String>> = Mutex::new(HashMap::new());
        let observed = Doc::observe_subdocs(self, move |txn, event| {
            let mut keys = keys.lock().unwrap_or_else(PoisonError::into_inner);
            let mut changes = SubdocsEvent::default();

            for doc in event.removed() {
                if let Some(key) = keys.remove(&doc.guid()) {
                    changes.removed.push(key);
                }
            }
            for doc in event.loaded() {
                match subdoc_key(txn, doc) {
                    Some(key) => {
                        keys.insert(doc.guid(), key.clone());
                        changes.loaded.push((key, Arc::new(doc.clone())));
                    }
                    None => log::warn!("Loaded subdocument {} is not held by a map", doc.guid()),
                }
            }
            drop(keys);

            if !changes.is_empty() {
                callback(changes);
            }
        });

        match observed {
            Ok(subscription) => Some(Box::new(subscription)),
            Err(e) => {
                log::warn!("Cannot observe subdocuments: {e}");
                None
            }
        }
    }
}

/// Key of the map entry holding `subdoc`, searching nested maps too.
fn subdoc_key<T: ReadTxn>(txn: &T, subdoc: &Doc) -> Option<String> {
    let guid = subdoc.guid();
    txn.root_refs().find_map(|(_, root)| match root {
        Out::YMap(map) => find_in_map(txn, &map, &guid),
        _ => None,
    })
}

fn find_in_map<T: ReadTxn>(txn: &T, map: &MapRef, guid: &yrs::Uuid) -> Option<String> {
    for (key, value) in map.iter(txn) {
        match value {
            Out::YDoc(doc) if doc.guid() == *guid => return Some(key.to_string()),
            Out::YMap(nested) => {
                if let Some(found) = find_in_map(txn, &nested, guid) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}
