//! Client identity, session context and the permission collaborator.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Permission;

/// Identity of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Per-connection capabilities the server needs from its host.
pub trait SessionContext: Send + Sync + 'static {
    fn client_id(&self) -> ClientId;

    /// Storage key for a document name. Hosts may scope names per tenant.
    fn document_id(&self, document: &str) -> String {
        document.to_string()
    }
}

/// Stock context: a client id and nothing else.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub client_id: ClientId,
}

impl ClientContext {
    pub fn new() -> Self {
        Self {
            client_id: ClientId::new(),
        }
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext for ClientContext {
    fn client_id(&self) -> ClientId {
        self.client_id
    }
}

/// Result of one permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionOutcome {
    pub permission: Permission,
    pub reason: String,
}

impl PermissionOutcome {
    pub fn granted() -> Self {
        Self {
            permission: Permission::Granted,
            reason: String::new(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            permission: Permission::Denied,
            reason: reason.into(),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.permission.is_granted()
    }
}

/// Decides whether a context may subscribe to a document.
#[async_trait]
pub trait PermissionCheck<C: SessionContext>: Send + Sync {
    async fn check_permission(&self, context: &C, document: &str) -> PermissionOutcome;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl<C: SessionContext> PermissionCheck<C> for AllowAll {
    async fn check_permission(&self, _context: &C, _document: &str) -> PermissionOutcome {
        PermissionOutcome::granted()
    }
}
