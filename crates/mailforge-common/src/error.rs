//! Error types for Mailforge

use thiserror::Error;

/// Main error type for Mailforge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Credential pool exhausted")]
    PoolExhausted,

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state transition: {0}")]
    State(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailforge
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the batch processor recovers from this error locally.
    ///
    /// Recoverable errors never abort a campaign: validation failures skip
    /// the recipient, quota denials halt the batch while the campaign stays
    /// running, transient credential and transport errors rotate the pool,
    /// and persistence failures are retried at the next progress point.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Validation(_)
            | Error::QuotaExceeded(_)
            | Error::Credential(_)
            | Error::Transport(_)
            | Error::Persistence(_) => true,
            Error::PoolExhausted
            | Error::Config(_)
            | Error::Concurrency(_)
            | Error::State(_)
            | Error::NotFound(_)
            | Error::Other(_) => false,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::Credential(_) => "CREDENTIAL_ERROR",
            Error::PoolExhausted => "POOL_EXHAUSTED",
            Error::Concurrency(_) => "CONCURRENCY_ERROR",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::State(_) => "INVALID_STATE",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
