//! Peer connection seam
//!
//! The session manager only talks to [`IngestPeer`] and [`PeerFactory`];
//! [`connection::WebRtcPeerFactory`] is the production binding.

pub mod connection;
pub mod source;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use whip_mpegts_core::{PacketSource, TrackCodec};

use crate::error::Result;
use crate::session::SessionId;

pub use connection::WebRtcPeerFactory;
pub use source::{track_channel, TrackPacketSource};

/// Local answer plus its media layout
#[derive(Debug, Clone)]
pub struct Answer {
    pub sdp: String,
    /// `a=mid` of every media description, in SDP order
    pub mids: Vec<Option<String>>,
}

impl Answer {
    /// Number of tracks the muxer will wait for
    pub fn track_count(&self) -> usize {
        self.mids.len()
    }
}

/// A remote track as it arrives from the peer
pub struct IncomingTrack {
    pub mid: Option<String>,
    pub codec: TrackCodec,
    pub source: Box<dyn PacketSource>,
}

impl std::fmt::Debug for IncomingTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingTrack")
            .field("mid", &self.mid)
            .field("codec", &self.codec.mime_type)
            .finish()
    }
}

#[derive(Debug)]
pub enum PeerEvent {
    Track(IncomingTrack),
    /// The connection failed or was closed by the remote side
    Closed,
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One publishing client's peer connection
#[async_trait]
pub trait IngestPeer: Send + Sync {
    /// Apply the client's offer and produce the local answer.
    ///
    /// Returns once ICE gathering has finished.
    async fn accept_offer(&self, offer_sdp: &str) -> Result<Answer>;

    /// Apply an updated remote description (WHIP PATCH).
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a peer for a new session.
    ///
    /// Track forwarders stop when `cancel` fires.
    async fn create(
        &self,
        session_id: &SessionId,
        cancel: CancellationToken,
    ) -> Result<(Arc<dyn IngestPeer>, PeerEvents)>;
}

/// Maps arriving tracks onto the answer's media description indices
#[derive(Debug)]
pub struct TrackSlots {
    mids: Vec<Option<String>>,
    used: Vec<bool>,
}

impl TrackSlots {
    pub fn new(mids: Vec<Option<String>>) -> Self {
        let used = vec![false; mids.len()];
        Self { mids, used }
    }

    /// Index for a track with the given `mid`.
    ///
    /// Unknown mids take the first free index. `None` means every index is
    /// taken or the mid was already assigned.
    pub fn assign(&mut self, mid: Option<&str>) -> Option<usize> {
        if let Some(mid) = mid {
            if let Some(index) = self.mids.iter().position(|m| m.as_deref() == Some(mid)) {
                if self.used[index] {
                    return None;
                }
                self.used[index] = true;
                return Some(index);
            }
        }
        let index = self.used.iter().position(|used| !used)?;
        self.used[index] = true;
        Some(index)
    }

    pub fn remaining(&self) -> usize {
        self.used.iter().filter(|used| !**used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(mids: &[&str]) -> TrackSlots {
        TrackSlots::new(mids.iter().map(|m| Some(m.to_string())).collect())
    }

    #[test]
    fn test_assign_by_mid() {
        let mut slots = slots(&["0", "1"]);
        assert_eq!(slots.assign(Some("1")), Some(1));
        assert_eq!(slots.assign(Some("0")), Some(0));
        assert_eq!(slots.remaining(), 0);
        assert_eq!(slots.assign(Some("0")), None);
    }

    #[test]
    fn test_unknown_mid_falls_back_to_arrival_order() {
        let mut slots = slots(&["audio", "video"]);
        assert_eq!(slots.assign(Some("video")), Some(1));
        assert_eq!(slots.assign(None), Some(0));
        assert_eq!(slots.assign(Some("extra")), None);
    }

    #[test]
    fn test_duplicate_mid_is_rejected() {
        let mut slots = slots(&["0", "1"]);
        assert_eq!(slots.assign(Some("0")), Some(0));
        assert_eq!(slots.assign(Some("0")), None);
        assert_eq!(slots.remaining(), 1);
    }
}
