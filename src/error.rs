//! Error types for the dialogue pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the dialogue pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture or playback device cannot be opened at the required format
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio processing error (stream failure, decode failure)
    #[error("audio error: {0}")]
    Audio(String),

    /// Backend could not be reached or the call timed out
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Backend answered with a non-success status
    #[error("backend error {status}: {message}")]
    Backend {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// A generation request is already in flight
    #[error("conversation busy: a generation request is already in flight")]
    ConversationBusy,

    /// Unit of work the pipeline cannot process
    #[error("malformed input: {0}")]
    Malformed(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::BackendUnreachable(format!("request timed out: {err}"))
        } else if let Some(status) = err.status() {
            Self::Backend {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::BackendUnreachable(err.to_string())
        }
    }
}

impl Error {
    /// Whether this error belongs to a backend call (dropped locally, never fatal)
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::BackendUnreachable(_) | Self::Backend { .. })
    }
}
