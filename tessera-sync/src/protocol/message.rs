//! Typed protocol messages.
//!
//! Every message targets one document by name and carries an `encrypted`
//! flag that is orthogonal to the payload type. The payload is either a
//! document step (sync handshake, updates, auth outcome) or an awareness
//! step (presence updates, presence request).

use super::codec;
use super::error::MalformedMessageError;

/// Category selector byte: document messages.
pub const CATEGORY_DOC: u8 = 0;
/// Category selector byte: awareness messages.
pub const CATEGORY_AWARENESS: u8 = 1;

/// Document step sub-tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DocStepKind {
    /// State vector handshake request
    SyncStep1 = 0,
    /// Catch-up response to a state vector
    SyncStep2 = 1,
    /// Incremental CRDT update
    Update = 2,
    /// Handshake finished
    SyncDone = 3,
    /// Permission outcome
    Auth = 4,
}

impl DocStepKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::SyncStep1),
            1 => Some(Self::SyncStep2),
            2 => Some(Self::Update),
            3 => Some(Self::SyncDone),
            4 => Some(Self::Auth),
            _ => None,
        }
    }
}

/// Awareness step sub-tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AwarenessStepKind {
    Update = 0,
    Request = 1,
}

impl AwarenessStepKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Update),
            1 => Some(Self::Request),
            _ => None,
        }
    }
}

/// Outcome carried by an auth message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Denied,
    Granted,
}

impl Permission {
    pub fn as_byte(self) -> u8 {
        match self {
            Permission::Denied => 0,
            Permission::Granted => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Permission::Denied),
            1 => Some(Permission::Granted),
            _ => None,
        }
    }

    pub fn is_granted(self) -> bool {
        self == Permission::Granted
    }
}

/// A document-category payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocStep {
    /// Encoded state vector of the sender.
    SyncStep1(Vec<u8>),
    /// Update containing everything the requester is missing.
    SyncStep2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
    SyncDone,
    Auth { permission: Permission, reason: String },
}

impl DocStep {
    pub fn kind(&self) -> DocStepKind {
        match self {
            DocStep::SyncStep1(_) => DocStepKind::SyncStep1,
            DocStep::SyncStep2(_) => DocStepKind::SyncStep2,
            DocStep::Update(_) => DocStepKind::Update,
            DocStep::SyncDone => DocStepKind::SyncDone,
            DocStep::Auth { .. } => DocStepKind::Auth,
        }
    }

    /// Update bytes for `sync-step-2` and `update`, `None` otherwise.
    pub fn update_bytes(&self) -> Option<&[u8]> {
        match self {
            DocStep::SyncStep2(update) | DocStep::Update(update) => Some(update),
            _ => None,
        }
    }

    /// Encode without the outer envelope, as exchanged by raw y-sync peers.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_doc_step(self)
    }

    /// Decode a step produced by [`DocStep::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedMessageError> {
        codec::decode_doc_step(bytes)
    }
}

/// An awareness-category payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessStep {
    Update(Vec<u8>),
    Request,
}

impl AwarenessStep {
    pub fn kind(&self) -> AwarenessStepKind {
        match self {
            AwarenessStep::Update(_) => AwarenessStepKind::Update,
            AwarenessStep::Request => AwarenessStepKind::Request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Doc(DocStep),
    Awareness(AwarenessStep),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Target document name
    pub document: String,
    /// Whether payload bytes are end-to-end encrypted
    pub encrypted: bool,
    pub payload: Payload,
}

impl Message {
    pub fn new(document: impl Into<String>, encrypted: bool, payload: Payload) -> Self {
        Self {
            document: document.into(),
            encrypted,
            payload,
        }
    }

    pub fn doc(document: impl Into<String>, encrypted: bool, step: DocStep) -> Self {
        Self::new(document, encrypted, Payload::Doc(step))
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(document: impl Into<String>, encrypted: bool, state_vector: Vec<u8>) -> Self {
        Self::doc(document, encrypted, DocStep::SyncStep1(state_vector))
    }

    /// Create a sync step 2 (catch-up response).
    pub fn sync_step2(document: impl Into<String>, encrypted: bool, update: Vec<u8>) -> Self {
        Self::doc(document, encrypted, DocStep::SyncStep2(update))
    }

    /// Create an incremental update message.
    pub fn update(document: impl Into<String>, encrypted: bool, update: Vec<u8>) -> Self {
        Self::doc(document, encrypted, DocStep::Update(update))
    }

    pub fn sync_done(document: impl Into<String>, encrypted: bool) -> Self {
        Self::doc(document, encrypted, DocStep::SyncDone)
    }

    pub fn auth(
        document: impl Into<String>,
        encrypted: bool,
        permission: Permission,
        reason: impl Into<String>,
    ) -> Self {
        Self::doc(
            document,
            encrypted,
            DocStep::Auth {
                permission,
                reason: reason.into(),
            },
        )
    }

    pub fn awareness_update(document: impl Into<String>, encrypted: bool, update: Vec<u8>) -> Self {
        Self::new(document, encrypted, Payload::Awareness(AwarenessStep::Update(update)))
    }

    pub fn awareness_request(document: impl Into<String>, encrypted: bool) -> Self {
        Self::new(document, encrypted, Payload::Awareness(AwarenessStep::Request))
    }

    pub fn category(&self) -> u8 {
        match self.payload {
            Payload::Doc(_) => CATEGORY_DOC,
            Payload::Awareness(_) => CATEGORY_AWARENESS,
        }
    }

    pub fn doc_step(&self) -> Option<&DocStep> {
        match &self.payload {
            Payload::Doc(step) => Some(step),
            Payload::Awareness(_) => None,
        }
    }

    /// Whether a broadcast of this message skips the client it came from.
    ///
    /// Payload-carrying messages are never echoed to their sender; control
    /// messages (`sync-done`, `auth`, awareness requests) reach every client.
    pub fn excludes_origin(&self) -> bool {
        match &self.payload {
            Payload::Doc(DocStep::SyncStep1(_))
            | Payload::Doc(DocStep::SyncStep2(_))
            | Payload::Doc(DocStep::Update(_)) => true,
            Payload::Doc(DocStep::SyncDone) | Payload::Doc(DocStep::Auth { .. }) => false,
            Payload::Awareness(AwarenessStep::Update(_)) => true,
            Payload::Awareness(AwarenessStep::Request) => false,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> BinaryMessage {
        codec::encode_message(self)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedMessageError> {
        codec::decode_message(bytes)
    }
}

/// An encoded message. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryMessage(Vec<u8>);

impl BinaryMessage {
    pub(crate) fn from_encoded(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn decode(&self) -> Result<Message, MalformedMessageError> {
        codec::decode_message(&self.0)
    }
}

impl AsRef<[u8]> for BinaryMessage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<BinaryMessage> for Vec<u8> {
    fn from(message: BinaryMessage) -> Self {
        message.0
    }
}
