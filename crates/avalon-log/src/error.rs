//! Error types for the log layer.

/// Errors from the log writer.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Filesystem failure while reading or writing the log file.
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The existing log file is not valid JSON, or a record failed to
    /// serialize.
    #[error("log serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// The writer task has stopped (all handles dropped or panicked).
    #[error("log writer is no longer running")]
    WriterGone,
}
