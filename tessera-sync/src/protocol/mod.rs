//! Binary wire protocol.
//!
//! Wire format:
//! ```text
//! ┌────────────┬─────────┬───────────────┬───────────┬──────────┬──────────┬─────────┐
//! │ magic      │ version │ doc name len  │ doc name  │ encrypted│ category │ payload │
//! │ 59 4A 53   │ 0x01    │ varuint       │ utf-8     │ 1 byte   │ 1 byte   │ ...     │
//! └────────────┴─────────┴───────────────┴───────────┴──────────┴──────────┴─────────┘
//! ```
//!
//! Document payloads start with a sub-tag (sync-step-1, sync-step-2, update,
//! sync-done, auth); awareness payloads with theirs (update, request).

pub mod codec;
pub mod error;
pub mod faux;
pub mod message;

pub use codec::{decode_doc_step, decode_message, encode_doc_step, encode_message, MAGIC, PROTOCOL_VERSION};
pub use error::MalformedMessageError;
pub use faux::{FauxStateVector, FauxUpdate, FauxUpdateList};
pub use message::{
    AwarenessStep, AwarenessStepKind, BinaryMessage, DocStep, DocStepKind, Message, Payload,
    Permission, CATEGORY_AWARENESS, CATEGORY_DOC,
};
