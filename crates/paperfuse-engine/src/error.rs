use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // The provider name must not be called `source`: thiserror would promote
    // that field to the error's cause.
    #[error("API error from {provider}: HTTP {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("rate limit from {provider}, retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("{provider} still failing after {attempts} attempts")]
    RetriesExhausted { provider: String, attempts: u32 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session already active at {0}")]
    SessionLocked(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] paperfuse_core::CoreError),

    #[error("fragment channel closed before workers finished")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the condition is worth retrying on a later run. Network-level
    /// failures and rate limiting are transient; a definitive API rejection
    /// or an unparseable payload is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } | Self::RetriesExhausted { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
