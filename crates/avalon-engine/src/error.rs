//! Engine error types.

use avalon_protocol::RoomCode;
use thiserror::Error;

/// Errors surfaced by room creation, the directory, and the handles.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The room-creation manifest cannot produce a legal game.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// No room is registered under this code.
    #[error("room {0} not found")]
    NotFound(RoomCode),

    /// The room actor is gone (shut down or crashed).
    #[error("room {0} is unavailable")]
    Unavailable(RoomCode),

    /// A join was rejected (seat taken, game full, unknown user).
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// A decision-service call failed during a phase where failure is
    /// not recoverable (agent startup, private-data delivery).
    #[error(transparent)]
    Gateway(#[from] avalon_agent::GatewayError),

    #[error(transparent)]
    Protocol(#[from] avalon_protocol::ProtocolError),
}
