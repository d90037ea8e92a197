//! Caller-owned holder of the active provider.

use std::sync::Arc;

use tokio::sync::watch;

use super::connection::Connection;
use super::provider::{DestroyOptions, Provider, ProviderOptions};
use super::replica::Replica;

/// Tracks which document is open on a shared connection.
///
/// Opening a document switches the current provider; subscribers see the
/// active provider immediately and every switch after that.
pub struct ProviderManager<R: Replica> {
    connection: Connection,
    current: watch::Sender<Option<Provider<R>>>,
}

impl<R: Replica> ProviderManager<R> {
    pub fn new(connection: Connection) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            connection,
            current,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Open `document`, replacing the current provider if there is one.
    pub async fn open(
        &self,
        document: impl Into<String>,
        replica: Arc<R>,
        options: ProviderOptions,
    ) -> Provider<R> {
        let document = document.into();
        let provider = match self.current() {
            Some(current) if current.document() == document && !current.is_destroyed() => {
                log::debug!("{document} already open");
                return current;
            }
            Some(current) => current.switch_document(document, replica, options).await,
            None => Provider::new(document, replica, self.connection.clone(), options),
        };
        self.current.send_replace(Some(provider.clone()));
        provider
    }

    pub fn current(&self) -> Option<Provider<R>> {
        self.current.borrow().clone()
    }

    /// The receiver starts out holding the active provider.
    pub fn subscribe(&self) -> watch::Receiver<Option<Provider<R>>> {
        self.current.subscribe()
    }

    /// Destroy the active provider.
    pub async fn destroy(&self, options: DestroyOptions) {
        if let Some(current) = self.current.send_replace(None) {
            current.destroy(options).await;
        } else if options.close_connection {
            self.connection.destroy();
        }
    }
}
