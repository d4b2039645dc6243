use thiserror::Error;

/// A malformed wire record. Always recoverable: the framer drops the
/// offending line and keeps the connection alive.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed wire record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty wire record")]
    Empty,
}
