//! Error types for the WHIP gateway

use crate::config::ConfigError;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pipeline failure from the core crate
    #[error(transparent)]
    Pipeline(#[from] whip_mpegts_core::Error),

    /// Peer connection setup or signaling failure
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Maximum sessions reached ({0})")]
    MaxSessionsReached(usize),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Gateway is shutting down and takes no new sessions
    #[error("Gateway shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if the client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MaxSessionsReached(_) | Error::ShuttingDown)
    }

    /// Check if the session's muxer can no longer produce output
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Pipeline(e) if e.is_fatal())
    }

    /// Check if the request itself was at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::UnsupportedMediaType(_)
                | Error::BadRequest(_)
                | Error::Pipeline(whip_mpegts_core::Error::Negotiation(_))
                | Error::Pipeline(whip_mpegts_core::Error::UnsupportedPayload(_))
        )
    }
}
