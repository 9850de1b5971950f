use std::time::Duration;

use thiserror::Error;

use super::messages::Topic;

/// Errors that can occur while talking to Twitch
#[derive(Debug, Error)]
pub enum TwitchError {
    /// Required credential fields are missing at connect time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket could not be opened or closed unexpectedly
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server never sent `session_welcome`
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// A single topic subscription was rejected
    #[error("Subscription to {topic} failed: {reason}")]
    Subscription { topic: Topic, reason: String },

    /// Token refresh request failed (HTTP status or transport)
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Token validation could not be completed
    #[error("Token validation failed: {0}")]
    ValidationFailed(String),

    /// Token revocation could not be completed
    #[error("Token revocation failed: {0}")]
    RevocationFailed(String),

    /// Automatic reconnection gave up
    #[error("Reconnection abandoned after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Credential storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
