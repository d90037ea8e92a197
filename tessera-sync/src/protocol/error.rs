use thiserror::Error;

/// Decode failure. Carries the full offending input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message: {reason} ({} bytes)", .bytes.len())]
pub struct MalformedMessageError {
    pub reason: String,
    pub bytes: Vec<u8>,
}

impl MalformedMessageError {
    pub fn new(reason: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            reason: reason.into(),
            bytes: bytes.to_vec(),
        }
    }
}
