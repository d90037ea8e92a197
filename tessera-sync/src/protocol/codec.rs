//! Byte-exact envelope codec.
//!
//! Wire format:
//! ```text
//! ┌────────────┬─────────┬──────────────┬───────────┬──────────┬──────────┬─────────────┐
//! │ magic      │ version │ doc name len │ doc name  │ encrypted│ category │ payload     │
//! │ "YJS" (3B) │ 1 byte  │ varuint      │ utf-8     │ 1 byte   │ 1 byte   │ variable    │
//! └────────────┴─────────┴──────────────┴───────────┴──────────┴──────────┴─────────────┘
//! ```
//!
//! Category 0 (document) payload: `[sub-tag:1]` then
//! - 0 sync-step-1: varbuf state vector
//! - 1 sync-step-2 / 2 update: varbuf update
//! - 3 sync-done: nothing
//! - 4 auth: `[permission:1]` varstring reason
//!
//! Category 1 (awareness) payload: `[sub-tag:1]` then
//! - 0 awareness-update: varbuf update
//! - 1 awareness-request: nothing
//!
//! Varints and length prefixes use the lib0 encoding shared with yrs.

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use super::error::MalformedMessageError;
use super::message::{
    AwarenessStep, AwarenessStepKind, BinaryMessage, DocStep, DocStepKind, Message, Payload,
    Permission, CATEGORY_AWARENESS, CATEGORY_DOC,
};

/// "YJS"
pub const MAGIC: [u8; 3] = [0x59, 0x4A, 0x53];
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Encode a message into its envelope.
pub fn encode_message(message: &Message) -> BinaryMessage {
    let mut buf: Vec<u8> = Vec::with_capacity(16 + message.document.len() + payload_hint(message));
    buf.write_all(&MAGIC);
    buf.write_u8(PROTOCOL_VERSION);
    buf.write_buf(message.document.as_bytes());
    buf.write_u8(u8::from(message.encrypted));
    buf.write_u8(message.category());
    match &message.payload {
        Payload::Doc(step) => write_doc_step(&mut buf, step),
        Payload::Awareness(step) => {
            buf.write_u8(step.kind() as u8);
            if let AwarenessStep::Update(update) = step {
                buf.write_buf(update);
            }
        }
    }
    BinaryMessage::from_encoded(buf)
}

/// Decode an envelope. Fails on anything but exactly one well-formed message.
pub fn decode_message(bytes: &[u8]) -> Result<Message, MalformedMessageError> {
    let mut reader = FrameReader::new(bytes);

    let magic = [
        reader.u8("magic")?,
        reader.u8("magic")?,
        reader.u8("magic")?,
    ];
    if magic != MAGIC {
        return Err(reader.fail(format!("bad magic {magic:02x?}")));
    }
    let version = reader.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(reader.fail(format!("unsupported protocol version {version}")));
    }

    let document = reader.string("document name")?;
    let encrypted = match reader.u8("encrypted flag")? {
        0 => false,
        1 => true,
        other => return Err(reader.fail(format!("invalid encrypted flag {other}"))),
    };

    let payload = match reader.u8("category")? {
        CATEGORY_DOC => Payload::Doc(read_doc_step(&mut reader)?),
        CATEGORY_AWARENESS => Payload::Awareness(read_awareness_step(&mut reader)?),
        other => return Err(reader.fail(format!("unknown category {other}"))),
    };

    reader.finish()?;
    Ok(Message {
        document,
        encrypted,
        payload,
    })
}

/// Encode a document step without the envelope.
pub fn encode_doc_step(step: &DocStep) -> Vec<u8> {
    let mut buf = Vec::new();
    write_doc_step(&mut buf, step);
    buf
}

/// Decode a document step produced by [`encode_doc_step`].
pub fn decode_doc_step(bytes: &[u8]) -> Result<DocStep, MalformedMessageError> {
    let mut reader = FrameReader::new(bytes);
    let step = read_doc_step(&mut reader)?;
    reader.finish()?;
    Ok(step)
}

fn payload_hint(message: &Message) -> usize {
    match &message.payload {
        Payload::Doc(DocStep::SyncStep1(bytes))
        | Payload::Doc(DocStep::SyncStep2(bytes))
        | Payload::Doc(DocStep::Update(bytes))
        | Payload::Awareness(AwarenessStep::Update(bytes)) => bytes.len() + 5,
        Payload::Doc(DocStep::Auth { reason, .. }) => reason.len() + 6,
        _ => 1,
    }
}

fn write_doc_step(buf: &mut Vec<u8>, step: &DocStep) {
    buf.write_u8(step.kind() as u8);
    match step {
        DocStep::SyncStep1(state_vector) => buf.write_buf(state_vector),
        DocStep::SyncStep2(update) | DocStep::Update(update) => buf.write_buf(update),
        DocStep::SyncDone => {}
        DocStep::Auth { permission, reason } => {
            buf.write_u8(permission.as_byte());
            buf.write_buf(reason.as_bytes());
        }
    }
}

fn read_doc_step(reader: &mut FrameReader<'_>) -> Result<DocStep, MalformedMessageError> {
    let tag = reader.u8("document sub-tag")?;
    let kind = DocStepKind::from_tag(tag)
        .ok_or_else(|| reader.fail(format!("unknown document sub-tag {tag}")))?;
    let step = match kind {
        DocStepKind::SyncStep1 => DocStep::SyncStep1(reader.buf("state vector")?),
        DocStepKind::SyncStep2 => DocStep::SyncStep2(reader.buf("update")?),
        DocStepKind::Update => DocStep::Update(reader.buf("update")?),
        DocStepKind::SyncDone => DocStep::SyncDone,
        DocStepKind::Auth => {
            let byte = reader.u8("permission")?;
            let permission = Permission::from_byte(byte)
                .ok_or_else(|| reader.fail(format!("invalid permission byte {byte}")))?;
            let reason = reader.string("auth reason")?;
            DocStep::Auth { permission, reason }
        }
    };
    Ok(step)
}

fn read_awareness_step(reader: &mut FrameReader<'_>) -> Result<AwarenessStep, MalformedMessageError> {
    let tag = reader.u8("awareness sub-tag")?;
    match AwarenessStepKind::from_tag(tag) {
        Some(AwarenessStepKind::Update) => Ok(AwarenessStep::Update(reader.buf("awareness update")?)),
        Some(AwarenessStepKind::Request) => Ok(AwarenessStep::Request),
        None => Err(reader.fail(format!("unknown awareness sub-tag {tag}"))),
    }
}

/// Cursor over one frame that reports failures against the whole input.
pub(crate) struct FrameReader<'a> {
    input: &'a [u8],
    cursor: Cursor<'a>,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            cursor: Cursor::new(input),
        }
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) -> MalformedMessageError {
        MalformedMessageError::new(reason, self.input)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8, MalformedMessageError> {
        let input = self.input;
        self.cursor
            .read_u8()
            .map_err(|e| MalformedMessageError::new(format!("failed to read {what}: {e}"), input))
    }

    pub(crate) fn var_u32(&mut self, what: &str) -> Result<u32, MalformedMessageError> {
        let input = self.input;
        self.cursor
            .read_var::<u32>()
            .map_err(|e| MalformedMessageError::new(format!("failed to read {what}: {e}"), input))
    }

    pub(crate) fn buf(&mut self, what: &str) -> Result<Vec<u8>, MalformedMessageError> {
        let input = self.input;
        match self.cursor.read_buf() {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => Err(MalformedMessageError::new(
                format!("failed to read {what}: {e}"),
                input,
            )),
        }
    }

    pub(crate) fn string(&mut self, what: &str) -> Result<String, MalformedMessageError> {
        let bytes = self.buf(what)?;
        String::from_utf8(bytes).map_err(|_| self.fail(format!("{what} is not valid utf-8")))
    }

    /// Reject trailing bytes after a complete frame.
    pub(crate) fn finish(mut self) -> Result<(), MalformedMessageError> {
        if self.cursor.read_u8().is_ok() {
            return Err(self.fail("trailing bytes after message"));
        }
        Ok(())
    }
}
