//! Plain backend: merged CRDT state per document.

use std::sync::Arc;

use async_trait::async_trait;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::kv::KeyValueStore;
use super::lock::DocumentLock;
use super::{DocumentStorage, Inbound, StorageError};
use crate::protocol::{DocStep, Message, Payload};
use crate::session::Session;

/// Stores one merged update blob per document and answers the sync
/// handshake from it.
pub struct PlainDocumentStorage {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<DocumentLock>,
}

impl PlainDocumentStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, lock: Arc<DocumentLock>) -> Self {
        Self { store, lock }
    }

    /// The persisted state of document `id`, encoded as one update.
    pub async fn load_state(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.get_item(id).await
    }

    /// Merge `update` into the persisted state under the document lock.
    pub async fn merge(&self, id: &str, update: &[u8]) -> Result<(), StorageError> {
        self.lock
            .with_lock(id, || async {
                let state = self.store.get_item(id).await?;
                let merged = merge_updates(state.as_deref(), update)?;
                self.store.set_item(id, &merged).await
            })
            .await
    }

    async fn answer_sync_step1(
        &self,
        state_vector: &[u8],
        inbound: &Inbound,
        session: &Session,
    ) -> Result<(), StorageError> {
        let state = self.store.get_item(session.id()).await?;
        let (diff, own_state_vector) = diff_against(state.as_deref(), state_vector)?;
        let origin = inbound.origin;

        session
            .send_to(origin, &Message::sync_step2(session.name(), false, diff))
            .await?;
        session
            .send_to(origin, &Message::sync_step1(session.name(), false, own_state_vector))
            .await?;
        session
            .send_to(origin, &Message::sync_done(session.name(), false))
            .await
    }
}

#[async_trait]
impl DocumentStorage for PlainDocumentStorage {
    async fn on_message(&self, inbound: &Inbound, session: &Session) -> Result<(), StorageError> {
        match &inbound.message.payload {
            Payload::Awareness(_) => {
                session.broadcast(&inbound.message, inbound.origin).await;
            }
            Payload::Doc(DocStep::SyncStep1(state_vector)) => {
                self.answer_sync_step1(state_vector, inbound, session).await?;
            }
            Payload::Doc(DocStep::SyncStep2(update)) | Payload::Doc(DocStep::Update(update)) => {
                self.merge(session.id(), update).await?;
                session.broadcast(&inbound.message, inbound.origin).await;
            }
            Payload::Doc(DocStep::SyncDone) | Payload::Doc(DocStep::Auth { .. }) => {
                log::trace!("Ignoring client control message on {}", session.id());
            }
        }
        Ok(())
    }

    async fn on_unload(&self, session: &Session) -> Result<(), StorageError> {
        log::debug!("Plain document {} unloaded", session.id());
        Ok(())
    }
}

fn load_doc(state: Option<&[u8]>) -> Result<Doc, StorageError> {
    let doc = Doc::new();
    if let Some(state) = state {
        apply_update(&doc, state)?;
    }
    Ok(doc)
}

fn apply_update(doc: &Doc, bytes: &[u8]) -> Result<(), StorageError> {
    let update = Update::decode_v1(bytes).map_err(|e| StorageError::Crdt(e.to_string()))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| StorageError::Crdt(e.to_string()))
}

/// Merged state after applying `update` on top of `state`.
fn merge_updates(state: Option<&[u8]>, update: &[u8]) -> Result<Vec<u8>, StorageError> {
    let doc = load_doc(state)?;
    apply_update(&doc, update)?;
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

/// The update a peer with `state_vector` is missing, and our own state vector.
///
/// An empty state vector means the peer knows nothing.
fn diff_against(state: Option<&[u8]>, state_vector: &[u8]) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
    let remote = if state_vector.is_empty() {
        StateVector::default()
    } else {
        StateVector::decode_v1(state_vector).map_err(|e| StorageError::Crdt(e.to_string()))?
    };
    let doc = load_doc(state)?;
    let txn = doc.transact();
    Ok((txn.encode_diff_v1(&remote), txn.state_vector().encode_v1()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientId;
    use crate::storage::kv::MemoryStore;
    use crate::storage::lock::LockConfig;
    use tokio::sync::mpsc;
    use yrs::{GetString, Map, MapPrelim, Text};

    fn storage() -> (Arc<MemoryStore>, Arc<PlainDocumentStorage>) {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(DocumentLock::new(store.clone(), LockConfig::for_testing()));
        (store.clone(), Arc::new(PlainDocumentStorage::new(store, lock)))
    }

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        drop(txn);
        let update = doc.transact().encode_state_as_update_v1(&StateVector::default());
        update
    }

    fn read_text(state: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        apply_update(&doc, state).unwrap();
        let txn = doc.transact();
        text.get_string(&txn)
    }

    async fn join(session: &Session) -> (ClientId, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        session.add_client(id, tx).await;
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<Vec<u8>>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(Message::decode(&bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_update_is_merged_and_broadcast() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", false, backend.clone());
        let (a, mut rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let update = Message::update("doc", false, text_update("hello"));
        session.handle(&Inbound::new(update.clone(), a)).await.unwrap();

        let stored = store.get_item("doc").await.unwrap().unwrap();
        assert_eq!(read_text(&stored), "hello");
        assert_eq!(drain(&mut rx_b), vec![update]);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_sync_step1_replies_to_sender_only() {
        let (_store, backend) = storage();
        backend.merge("doc", &text_update("persisted")).await.unwrap();

        let session = Session::new("doc", "doc", false, backend.clone());
        let (a, mut rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        session
            .handle(&Inbound::new(Message::sync_step1("doc", false, vec![]), a))
            .await
            .unwrap();

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 3);
        match replies[0].doc_step() {
            Some(DocStep::SyncStep2(diff)) => assert_eq!(read_text(diff), "persisted"),
            other => panic!("expected sync-step-2, got {other:?}"),
        }
        assert!(matches!(replies[1].doc_step(), Some(DocStep::SyncStep1(_))));
        assert_eq!(replies[2], Message::sync_done("doc", false));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_sync_step1_with_current_state_vector_is_empty_diff() {
        let (_store, backend) = storage();
        let update = text_update("abc");
        backend.merge("doc", &update).await.unwrap();

        let doc = load_doc(Some(&update)).unwrap();
        let sv = doc.transact().state_vector().encode_v1();
        let state = backend.load_state("doc").await.unwrap();
        let (diff, _) = diff_against(state.as_deref(), &sv).unwrap();

        let empty = Doc::new();
        apply_update(&empty, &diff).unwrap();
        assert_eq!(empty.transact().state_vector(), StateVector::default());
    }

    #[tokio::test]
    async fn test_invalid_update_not_broadcast() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", false, backend);
        let (a, _rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let result = session
            .handle(&Inbound::new(Message::update("doc", false, vec![0xFF, 0xFF, 0xFF]), a))
            .await;
        assert!(matches!(result, Err(StorageError::Crdt(_))));
        assert!(drain(&mut rx_b).is_empty());
        assert!(store.get_item("doc").await.unwrap().is_none());
    }

    /// Stored state holding a text item, and an update that decodes but
    /// names that text item as the parent of a map entry.
    fn misparented_update() -> (Vec<u8>, Vec<u8>) {
        let text_doc = Doc::with_client_id(7);
        let text = text_doc.get_or_insert_text("content");
        text.insert(&mut text_doc.transact_mut(), 0, "a");
        let state = text_doc.transact().encode_state_as_update_v1(&StateVector::default());

        let map_doc = Doc::with_client_id(7);
        let root = map_doc.get_or_insert_map("m");
        let nested = root.insert(&mut map_doc.transact_mut(), "k", MapPrelim::default());
        let before = map_doc.transact().state_vector();
        nested.insert(&mut map_doc.transact_mut(), "x", "v");
        let update = map_doc.transact().encode_diff_v1(&before);
        (state, update)
    }

    #[tokio::test]
    async fn test_update_failing_integration_not_stored_or_broadcast() {
        let (store, backend) = storage();
        let (state, update) = misparented_update();
        store.set_item("doc", &state).await.unwrap();

        let session = Session::new("doc", "doc", false, backend);
        let (a, _rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let result = session
            .handle(&Inbound::new(Message::update("doc", false, update), a))
            .await;
        assert!(matches!(result, Err(StorageError::Crdt(_))));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(store.get_item("doc").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_awareness_broadcast_and_control_ignored() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", false, backend);
        let (a, mut rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let presence = Message::awareness_update("doc", false, vec![4, 2]);
        session.handle(&Inbound::new(presence.clone(), a)).await.unwrap();
        session
            .handle(&Inbound::new(Message::sync_done("doc", false), a))
            .await
            .unwrap();

        assert_eq!(drain(&mut rx_b), vec![presence]);
        assert!(drain(&mut rx_a).is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_merges_converge() {
        let (store, backend) = storage();
        let mut handles = Vec::new();
        for word in ["alpha", "beta", "gamma"] {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.merge("doc", &text_update(word)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let merged = read_text(&store.get_item("doc").await.unwrap().unwrap());
        for word in ["alpha", "beta", "gamma"] {
            assert!(merged.contains(word), "{merged} lacks {word}");
        }
    }
}
