//! Integration tests for awareness (presence) over a real server.

use std::sync::Arc;

use tessera_sync::auth::ClientContext;
use tessera_sync::client::{
    Connection, ConnectionConfig, DestroyOptions, DocumentKey, Provider, ProviderEvent,
    ProviderOptions,
};
use tessera_sync::server::{Server, ServerConfig};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use yrs::Doc;

async fn start_test_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server: Server<ClientContext> =
        Server::new(ServerConfig::for_testing("127.0.0.1:0")).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener, |_| ClientContext::new()).await;
    });
    port
}

async fn provider(port: u16, document: &str, options: ProviderOptions) -> Provider<Doc> {
    let conn = Connection::websocket(ConnectionConfig::for_testing(format!("ws://127.0.0.1:{port}")));
    let provider = Provider::new(document, Arc::new(Doc::new()), conn, options);
    timeout(Duration::from_secs(2), provider.synced()).await.unwrap().unwrap();
    provider
}

async fn wait_for_awareness(provider: &Provider<Doc>, peer: uuid::Uuid, state: Option<&[u8]>) {
    for _ in 0..100 {
        if provider.awareness_states().get(&peer).map(Vec::as_slice) == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("awareness of {peer} never became {state:?}");
}

#[tokio::test]
async fn test_awareness_reaches_peer() {
    let port = start_test_server().await;
    let alice_options = ProviderOptions::default();
    let alice_id = alice_options.client_id;
    let alice = provider(port, "doc", alice_options).await;
    let bob = provider(port, "doc", ProviderOptions::default()).await;
    let mut events = bob.events();

    alice.set_awareness(Some(b"cursor:10".to_vec())).await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ProviderEvent::AwarenessChanged { client: alice_id });
    wait_for_awareness(&bob, alice_id, Some(b"cursor:10")).await;

    // The sender does not track itself
    assert!(alice.awareness_states().is_empty());
}

#[tokio::test]
async fn test_awareness_request_brings_late_joiner_up_to_date() {
    let port = start_test_server().await;
    let alice_options = ProviderOptions::default();
    let alice_id = alice_options.client_id;
    let alice = provider(port, "doc", alice_options).await;
    alice.set_awareness(Some(b"selection:2..5".to_vec())).await.unwrap();

    let bob = provider(port, "doc", ProviderOptions::default()).await;
    bob.request_awareness().await.unwrap();
    wait_for_awareness(&bob, alice_id, Some(b"selection:2..5")).await;
}

#[tokio::test]
async fn test_destroy_announces_departure() {
    let port = start_test_server().await;
    let alice_options = ProviderOptions::default();
    let alice_id = alice_options.client_id;
    let alice = provider(port, "doc", alice_options).await;
    let bob = provider(port, "doc", ProviderOptions::default()).await;

    alice.set_awareness(Some(b"here".to_vec())).await.unwrap();
    wait_for_awareness(&bob, alice_id, Some(b"here")).await;

    alice.destroy(DestroyOptions::default()).await;
    wait_for_awareness(&bob, alice_id, None).await;
}

#[tokio::test]
async fn test_encrypted_awareness() {
    let port = start_test_server().await;
    let key = DocumentKey::generate();
    let alice_options = ProviderOptions::encrypted(key.clone());
    let alice_id = alice_options.client_id;
    let alice = provider(port, "vault", alice_options).await;
    let bob = provider(port, "vault", ProviderOptions::encrypted(key)).await;

    alice.set_awareness(Some(b"secret cursor".to_vec())).await.unwrap();
    wait_for_awareness(&bob, alice_id, Some(b"secret cursor")).await;
}

#[tokio::test]
async fn test_awareness_scoped_to_document() {
    let port = start_test_server().await;
    let alice_options = ProviderOptions::default();
    let alice_id = alice_options.client_id;
    let alice = provider(port, "one", alice_options).await;
    let bob = provider(port, "two", ProviderOptions::default()).await;

    alice.set_awareness(Some(b"elsewhere".to_vec())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.awareness_states().get(&alice_id).is_none());
}
