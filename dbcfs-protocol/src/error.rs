//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or transcoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("field overflow: {field} is {len} bytes (max {max})")]
    FieldOverflow {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid byte-safe sequence: unexpected byte {0:#04x} in lead position")]
    InvalidSequence(u8),

    #[error("byte-safe sequence truncated by end of stream")]
    TruncatedSequence,

    #[error("send/recv protocol out of sync: expected {expected:?}, got {actual:?}")]
    Desync { expected: String, actual: String },
}

impl ProtocolError {
    /// Returns whether this error means the byte stream can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ProtocolError::Desync { .. }
                | ProtocolError::InvalidSequence(_)
                | ProtocolError::TruncatedSequence
        )
    }
}
