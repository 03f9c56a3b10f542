//! Bridge from async track readers to the blocking [`PacketSource`] pull

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use whip_mpegts_core::{PacketSource, RtpPacket, SourceError};

/// Pull side of one remote track's packet queue.
///
/// Blocks the calling OS thread on the runtime `handle`; never call it
/// from an async worker.
pub struct TrackPacketSource {
    rx: mpsc::Receiver<RtpPacket>,
    handle: Handle,
}

/// Bounded queue between a track forwarder task and its demuxer
pub fn track_channel(capacity: usize, handle: Handle) -> (mpsc::Sender<RtpPacket>, TrackPacketSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, TrackPacketSource { rx, handle })
}

impl PacketSource for TrackPacketSource {
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<RtpPacket>, SourceError> {
        let rx = &mut self.rx;
        match timeout {
            // A closed queue is the end of the track
            None => Ok(self.handle.block_on(rx.recv())),
            Some(timeout) => self
                .handle
                .block_on(async { tokio::time::timeout(timeout, rx.recv()).await })
                .map_err(|_| SourceError::Timeout),
        }
    }
}

impl std::fmt::Debug for TrackPacketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackPacketSource")
            .field("queued", &self.rx.len())
            .finish()
    }
}
