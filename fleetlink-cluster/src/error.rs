//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed packet or unknown identification. Logged and dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake rejected; the worker retries on its next ping
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Client refused by a soft/hard cap or by an empty family
    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Core(#[from] fleetlink_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
