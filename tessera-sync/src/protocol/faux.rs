//! Faux update lists and faux state vectors.
//!
//! Zero-knowledge documents never expose CRDT updates to the server. Clients
//! instead send an opaque list of records, each tagged with a message id, and
//! catch up by naming the newest message id they hold.
//!
//! ```text
//! list:   [count: varuint] ([message_id: varstring][update: varbuf])*
//! vector: <empty> | [message_id: varstring]
//! ```

use yrs::encoding::write::Write;

use super::codec::FrameReader;
use super::error::MalformedMessageError;

/// One opaque record of a faux update list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FauxUpdate {
    pub message_id: String,
    pub update: Vec<u8>,
}

impl FauxUpdate {
    pub fn new(message_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            update,
        }
    }

    /// Create a record with a fresh random message id.
    pub fn with_random_id(update: Vec<u8>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), update)
    }
}

/// Ordered, append-only list of faux updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FauxUpdateList(Vec<FauxUpdate>);

impl FauxUpdateList {
    pub fn new(records: Vec<FauxUpdate>) -> Self {
        Self(records)
    }

    /// Encoding of a list without records.
    pub fn empty_encoded() -> Vec<u8> {
        FauxUpdateList::default().encode()
    }

    pub fn records(&self) -> &[FauxUpdate] {
        &self.0
    }

    pub fn into_records(self) -> Vec<FauxUpdate> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: FauxUpdateList) {
        self.0.extend(other.0);
    }

    /// Records strictly after the one with `message_id`.
    ///
    /// Returns every record when `message_id` is `None` or not present.
    pub fn after(&self, message_id: Option<&str>) -> FauxUpdateList {
        let start = message_id
            .and_then(|id| self.0.iter().position(|record| record.message_id == id))
            .map_or(0, |index| index + 1);
        FauxUpdateList(self.0[start..].to_vec())
    }

    /// Message id of the newest record.
    pub fn last_message_id(&self) -> Option<&str> {
        self.0.last().map(|record| record.message_id.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + self
                .0
                .iter()
                .map(|r| r.message_id.len() + r.update.len() + 10)
                .sum::<usize>(),
        );
        buf.write_var(self.0.len() as u32);
        for record in &self.0 {
            buf.write_buf(record.message_id.as_bytes());
            buf.write_buf(&record.update);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedMessageError> {
        let mut reader = FrameReader::new(bytes);
        let count = reader.var_u32("faux record count")?;
        // Each record takes at least two bytes, so a count beyond that is a lie.
        if count as usize > bytes.len() / 2 {
            return Err(reader.fail(format!("faux record count {count} exceeds input")));
        }
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let message_id = reader.string("faux message id")?;
            let update = reader.buf("faux update")?;
            records.push(FauxUpdate { message_id, update });
        }
        reader.finish()?;
        Ok(Self(records))
    }

    /// Append the records of `addition` to the encoded list `existing`.
    pub fn append(existing: &[u8], addition: FauxUpdateList) -> Result<Vec<u8>, MalformedMessageError> {
        let mut list = FauxUpdateList::decode(existing)?;
        list.extend(addition);
        Ok(list.encode())
    }
}

impl From<Vec<FauxUpdate>> for FauxUpdateList {
    fn from(records: Vec<FauxUpdate>) -> Self {
        Self(records)
    }
}

/// The newest message id a client holds, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FauxStateVector {
    pub message_id: Option<String>,
}

impl FauxStateVector {
    pub fn new(message_id: Option<String>) -> Self {
        Self { message_id }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(id) = &self.message_id {
            buf.write_buf(id.as_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedMessageError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = FrameReader::new(bytes);
        let id = reader.string("faux state vector message id")?;
        reader.finish()?;
        Ok(Self {
            message_id: Some(id),
        })
    }
}
