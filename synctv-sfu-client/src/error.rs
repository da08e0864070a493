use std::time::Duration;
use thiserror::Error;

use crate::signaling::ConnectionState;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Signaling connection lost")]
    ConnectionLost,

    #[error("Signaling channel is not open (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Request '{method}' rejected by server ({code}): {reason}")]
    RequestRejected {
        method: String,
        code: u16,
        reason: String,
    },

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Transport negotiation failed: {0}")]
    Negotiation(String),

    #[error("Local media unavailable: {0}")]
    LocalMedia(String),

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error ends the whole session when it reaches the orchestrator.
    ///
    /// Request rejections and negotiation failures are scoped to their caller or
    /// transport; the session-level escalation for precondition requests happens
    /// in the orchestrator, not here.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost
                | Self::NotConnected(_)
                | Self::LocalMedia(_)
                | Self::CodecUnavailable(_)
                | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
