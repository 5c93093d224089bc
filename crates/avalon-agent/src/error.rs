//! Error types for the agent gateway.

/// Errors from talking to the decision service.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport-level failure (connect, send, receive, decode).
    /// Already past the retry budget when surfaced to callers.
    #[error("decision service transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered but flagged the call as unsuccessful.
    #[error("decision service rejected the call: {0}")]
    Rejected(String),

    /// A startup reply without an agent id cannot seat an agent.
    #[error("startup reply missing agent id")]
    MissingAgentId,
}

impl GatewayError {
    /// Transport errors are worth retrying; rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
