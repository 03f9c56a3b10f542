//! Error types for the ingest pipeline

use crate::adapter::AdapterError;

/// Result type alias using the pipeline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assembling or running a muxing pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Offer/answer could not be turned into a usable track layout
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Not every negotiated track arrived before the deadline
    #[error("Timed out waiting for tracks: {arrived} of {expected} arrived")]
    BarrierTimeout { expected: usize, arrived: usize },

    /// Barrier was released, dropped, or lost every registrar
    #[error("Track barrier closed")]
    BarrierClosed,

    /// Track registered under an index outside the negotiated range
    #[error("Track index {index} out of range (expected {expected} tracks)")]
    TrackIndex { index: usize, expected: usize },

    /// Packet source or byte-stream adapter failure
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Negotiated codec has no payload format description
    #[error("Unsupported payload format: {0}")]
    UnsupportedPayload(String),

    /// Engine setup failure (open, probe, stream declaration)
    #[error("Engine error: {0}")]
    Engine(String),

    /// Engine write failure; the shared muxer state is no longer usable
    #[error("Fatal engine error: {0}")]
    EngineFatal(String),

    /// Operation on a muxer that already failed or finished
    #[error("Muxer closed")]
    MuxerClosed,

    /// The output stream reader was dropped
    #[error("Output consumer gone")]
    ConsumerGone,

    /// Operation aborted because its owner shut down
    #[error("Cancelled")]
    Cancelled,

    /// Illegal state machine transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState { from: String, to: String },

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error invalidates the whole muxer
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::EngineFatal(_) | Error::ConsumerGone | Error::Internal(_)
        )
    }

    /// Check if this error only affects a single track
    pub fn is_track_local(&self) -> bool {
        matches!(self, Error::Adapter(_))
    }

    /// Check if this error happened before any output was produced
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_)
                | Error::BarrierTimeout { .. }
                | Error::BarrierClosed
                | Error::TrackIndex { .. }
                | Error::UnsupportedPayload(_)
                | Error::Engine(_)
        )
    }
}
