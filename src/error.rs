use thiserror::Error;

/// Top-level error type for the pipeline.
///
/// Mirrors the reference downloader's convention of one `thiserror` enum per
/// crate plus a boolean classifier, rather than baking retryability into each
/// variant.
#[derive(Debug, Error)]
pub enum HlsError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport timed out")]
    Timeout,

    #[error("key fetch failed for {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("key response had {got} bytes, expected 16")]
    InvalidKeyLength { got: usize },

    #[error("invalid IV: {0}")]
    InvalidIv(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("end of stream")]
    Eos,

    #[error("buffer full")]
    Full,

    #[error("buffer empty")]
    Empty,

    #[error("timed out waiting for buffer")]
    BufferTimeout,

    #[error("no such playlist: {0}")]
    UnknownPlaylist(String),

    #[error("internal invariant violation: {reason}")]
    Internal { reason: String },
}

impl HlsError {
    pub fn internal(reason: impl Into<String>) -> Self {
        HlsError::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the condition is worth retrying at the transport-read "again"
    /// point. Everything else is terminal for the current download attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HlsError::Transport(_) | HlsError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, HlsError>;
