//! Zero-knowledge backend: opaque, append-only update lists.
//!
//! The server never decrypts or merges anything. It keeps the records clients
//! send in arrival order and hands each client the records it has not seen.

use std::sync::Arc;

use async_trait::async_trait;

use super::kv::KeyValueStore;
use super::lock::DocumentLock;
use super::{DocumentStorage, Inbound, StorageError};
use crate::protocol::{DocStep, FauxStateVector, FauxUpdateList, Message, Payload};
use crate::session::Session;

pub struct ZeroKnowledgeStorage {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<DocumentLock>,
}

impl ZeroKnowledgeStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, lock: Arc<DocumentLock>) -> Self {
        Self { store, lock }
    }

    /// Persisted records of document `id`; empty when nothing is stored.
    pub async fn load_updates(&self, id: &str) -> Result<FauxUpdateList, StorageError> {
        match self.store.get_item(id).await? {
            Some(bytes) => Ok(FauxUpdateList::decode(&bytes)?),
            None => Ok(FauxUpdateList::default()),
        }
    }

    /// Append `addition` to the persisted list under the document lock.
    pub async fn append(&self, id: &str, addition: FauxUpdateList) -> Result<(), StorageError> {
        self.lock
            .with_lock(id, || self.append_locked(id, addition))
            .await
    }

    /// Caller holds the document lock.
    async fn append_locked(&self, id: &str, addition: FauxUpdateList) -> Result<(), StorageError> {
        let appended = match self.store.get_item(id).await? {
            Some(existing) => FauxUpdateList::append(&existing, addition)?,
            None => addition.encode(),
        };
        self.store.set_item(id, &appended).await
    }

    /// Append and broadcast in one locked section, so every client receives
    /// records in list order and its newest id is a valid catch-up point.
    async fn append_and_broadcast(
        &self,
        update: &[u8],
        inbound: &Inbound,
        session: &Session,
    ) -> Result<(), StorageError> {
        let addition = FauxUpdateList::decode(update)?;
        self.lock
            .with_lock(session.id(), || async {
                self.append_locked(session.id(), addition).await?;
                session.broadcast(&inbound.message, inbound.origin).await;
                Ok(())
            })
            .await
    }

    async fn answer_sync_step1(
        &self,
        state_vector: &[u8],
        inbound: &Inbound,
        session: &Session,
    ) -> Result<(), StorageError> {
        let known = FauxStateVector::decode(state_vector)?;
        let origin = inbound.origin;

        self.lock
            .with_lock(session.id(), || async {
                if !session.has_client(&origin).await {
                    return Err(StorageError::ClientNotFound(origin));
                }
                let updates = self.load_updates(session.id()).await?;
                let missing = updates.after(known.message_id.as_deref());
                log::debug!(
                    "Sending {}/{} records of {} to {origin}",
                    missing.len(),
                    updates.len(),
                    session.id()
                );
                session
                    .send_to(origin, &Message::sync_step2(session.name(), true, missing.encode()))
                    .await?;
                session
                    .send_to(origin, &Message::sync_done(session.name(), true))
                    .await
            })
            .await
    }
}

#[async_trait]
impl DocumentStorage for ZeroKnowledgeStorage {
    async fn on_message(&self, inbound: &Inbound, session: &Session) -> Result<(), StorageError> {
        let message = &inbound.message;
        let step = match &message.payload {
            Payload::Doc(step) => step,
            Payload::Awareness(_) => {
                session.broadcast(message, inbound.origin).await;
                return Ok(());
            }
        };

        if !message.encrypted {
            log::warn!("Rejecting plaintext {:?} on {}", step.kind(), session.id());
            return Err(StorageError::UnencryptedMessageRejected {
                document: session.name().to_string(),
            });
        }

        match step {
            DocStep::SyncStep1(state_vector) => {
                self.answer_sync_step1(state_vector, inbound, session).await
            }
            DocStep::SyncStep2(update) | DocStep::Update(update) => {
                self.append_and_broadcast(update, inbound, session).await
            }
            DocStep::SyncDone | DocStep::Auth { .. } => {
                log::trace!("Ignoring client control message on {}", session.id());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientId;
    use crate::protocol::FauxUpdate;
    use crate::storage::kv::{now_millis, MemoryStore};
    use crate::storage::lock::LockConfig;
    use tokio::sync::mpsc;

    fn storage() -> (Arc<MemoryStore>, Arc<ZeroKnowledgeStorage>) {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(DocumentLock::new(store.clone(), LockConfig::for_testing()));
        (store.clone(), Arc::new(ZeroKnowledgeStorage::new(store, lock)))
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

    fn records(ids: &[&str]) -> FauxUpdateList {
        ids.iter()
            .map(|id| FauxUpdate::new(*id, id.as_bytes().to_vec()))
            .collect::<Vec<_>>()
            .into()
    }

    fn sync_step2_records(message: &Message) -> FauxUpdateList {
        match message.doc_step() {
            Some(DocStep::SyncStep2(update)) => FauxUpdateList::decode(update).unwrap(),
            other => panic!("expected sync-step-2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_document_sync() {
        let (_store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend);
        let (a, mut rx_a) = join(&session).await;

        session
            .handle(&Inbound::new(Message::sync_step1("doc", true, vec![]), a))
            .await
            .unwrap();

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], Message::sync_step2("doc", true, vec![0]));
        assert_eq!(replies[1], Message::sync_done("doc", true));
    }

    #[tokio::test]
    async fn test_update_appends_and_broadcasts() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend.clone());
        let (a, mut rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let list: FauxUpdateList = vec![FauxUpdate::new("m1", vec![1, 2, 3])].into();
        let update = Message::update("doc", true, list.encode());
        session.handle(&Inbound::new(update.clone(), a)).await.unwrap();

        let stored = FauxUpdateList::decode(&store.get_item("doc").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored, list);
        assert_eq!(drain(&mut rx_b), vec![update]);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_from_known_record() {
        let (_store, backend) = storage();
        backend.append("doc", records(&["m1", "m2", "m3", "m4"])).await.unwrap();

        let session = Session::new("doc", "doc", true, backend);
        let (a, mut rx_a) = join(&session).await;

        let sv = FauxStateVector::new(Some("m2".into())).encode();
        session
            .handle(&Inbound::new(Message::sync_step1("doc", true, sv), a))
            .await
            .unwrap();

        let replies = drain(&mut rx_a);
        assert_eq!(sync_step2_records(&replies[0]), records(&["m3", "m4"]));
        assert_eq!(replies[1], Message::sync_done("doc", true));
    }

    #[tokio::test]
    async fn test_unknown_record_sends_everything() {
        let (_store, backend) = storage();
        backend.append("doc", records(&["m1", "m2"])).await.unwrap();

        let session = Session::new("doc", "doc", true, backend);
        let (a, mut rx_a) = join(&session).await;

        let sv = FauxStateVector::new(Some("elsewhere".into())).encode();
        session
            .handle(&Inbound::new(Message::sync_step1("doc", true, sv), a))
            .await
            .unwrap();

        assert_eq!(sync_step2_records(&drain(&mut rx_a)[0]), records(&["m1", "m2"]));
    }

    #[tokio::test]
    async fn test_plaintext_document_message_rejected() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend);
        let (a, _rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let err = session
            .handle(&Inbound::new(Message::update("doc", false, records(&["m1"]).encode()), a))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnencryptedMessageRejected { ref document } if document == "doc"));
        assert!(store.get_item("doc").await.unwrap().is_none());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_awareness_passes_through_without_flag() {
        let (_store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend);
        let (a, _rx_a) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let presence = Message::awareness_update("doc", false, vec![1]);
        session.handle(&Inbound::new(presence.clone(), a)).await.unwrap();
        assert_eq!(drain(&mut rx_b), vec![presence]);
    }

    #[tokio::test]
    async fn test_sync_step1_from_unknown_client() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend);
        let stranger = ClientId::new();

        let err = session
            .handle(&Inbound::new(Message::sync_step1("doc", true, vec![]), stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ClientNotFound(id) if id == stranger));

        // The failed section still released its lock
        let meta = store.get_meta("doc").await.unwrap().unwrap();
        assert!(!meta.is_active(now_millis()));
    }

    #[tokio::test]
    async fn test_malformed_update_list_rejected() {
        let (store, backend) = storage();
        let session = Session::new("doc", "doc", true, backend);
        let (a, _rx_a) = join(&session).await;

        let err = session
            .handle(&Inbound::new(Message::update("doc", true, vec![5, 1]), a))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));
        assert!(store.get_item("doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_every_record() {
        let (_store, backend) = storage();
        let mut handles = Vec::new();
        for i in 0..5 {
            let backend = backend.clone();
            let id = format!("m{i}");
            handles.push(tokio::spawn(async move {
                backend.append("doc", records(&[id.as_str()])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.load_updates("doc").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_updates_delivered_in_list_order() {
        let (_store, backend) = storage();
        let session = Arc::new(Session::new("doc", "doc", true, backend.clone()));
        let (a, _rx_a) = join(&session).await;
        let (c, _rx_c) = join(&session).await;
        let (_b, mut rx_b) = join(&session).await;

        let mut handles = Vec::new();
        for (i, origin) in [a, c, a, c, a, c].into_iter().enumerate() {
            let session = session.clone();
            let update = Message::update("doc", true, records(&[format!("m{i}").as_str()]).encode());
            handles.push(tokio::spawn(async move {
                session.handle(&Inbound::new(update, origin)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let delivered: Vec<String> = drain(&mut rx_b)
            .iter()
            .flat_map(|m| {
                let list = FauxUpdateList::decode(m.doc_step().unwrap().update_bytes().unwrap()).unwrap();
                list.into_records().into_iter().map(|r| r.message_id)
            })
            .collect();
        let stored: Vec<String> = backend
            .load_updates("doc")
            .await
            .unwrap()
            .into_records()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(stored.len(), 6);
        assert_eq!(delivered, stored);
    }
}
