//! Live RTP packet sources

use std::time::Duration;

use webrtc::rtp::packet::Packet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("timed out waiting for packet")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("source closed")]
    Closed,
}

/// Blocking pull side of one remote track.
///
/// Implementations are driven from a dedicated OS thread, never from an
/// async worker.
pub trait PacketSource: Send {
    /// Next packet, `Ok(None)` once the track is exhausted.
    ///
    /// `timeout` bounds the wait; `None` waits indefinitely.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, SourceError>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, SourceError> {
        (**self).recv(timeout)
    }
}
