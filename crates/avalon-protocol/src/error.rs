//! Error types for the protocol layer.

/// Errors produced while building or parsing protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A seat number outside 1..=6.
    #[error("invalid position: {0} (expected 1..=6)")]
    InvalidPosition(u8),

    /// A role string with no matching [`Role`](crate::Role) value.
    #[error("invalid role: {0:?}")]
    InvalidRole(String),

    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}
