//! Error types for ProEdit.

use thiserror::Error;

/// Main error type for ProEdit operations.
#[derive(Error, Debug)]
pub enum ProEditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Decode worker {worker} failed to start: {reason}")]
    WorkerInit { worker: usize, reason: String },

    #[error("Decode worker {0} crashed")]
    WorkerCrashed(usize),

    #[error("Resource disposed")]
    Disposed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProEditError {
    /// Superseded or torn-down work, as opposed to a genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Disposed)
    }

    pub fn decoder(msg: impl Into<String>) -> Self {
        Self::Decoder(msg.into())
    }
}

/// Result type alias for ProEdit operations.
pub type Result<T> = std::result::Result<T, ProEditError>;
