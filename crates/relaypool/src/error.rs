//! Error types for the relay pool

use thiserror::Error;

/// Errors returned by relay connections and the pool
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Misuse of the subscribe API. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Write relay lookup failed for {pubkey}: {reason}")]
    WriteRelayLookup { pubkey: String, reason: String },

    #[error("Event not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Relay pool is closed")]
    Closed,
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, ClientError>;
