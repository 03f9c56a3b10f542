//! webrtc-rs peer connections for WHIP publishers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;
use webrtc::track::track_remote::TrackRemote;
use whip_mpegts_core::{Error as PipelineError, RtpPacket, TrackCodec};

use super::{track_channel, Answer, IncomingTrack, IngestPeer, PeerEvent, PeerEvents, PeerFactory};
use crate::config::WebRtcConfig;
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Creates one receive-only webrtc-rs peer connection per session
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    config: WebRtcConfig,
    track_queue_capacity: usize,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcConfig, track_queue_capacity: usize) -> Self {
        Self {
            config,
            track_queue_capacity,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    #[instrument(skip(self, cancel), fields(session_id = %session_id))]
    async fn create(
        &self,
        session_id: &SessionId,
        cancel: CancellationToken,
    ) -> Result<(Arc<dyn IngestPeer>, PeerEvents)> {
        // Opus for audio, VP8/VP9/H.264 for video
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_events = events_tx.clone();
        let state_session = session_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                let session_id = state_session.clone();
                Box::pin(async move {
                    debug!(session_id = %session_id, ?state, "Peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        let _ = events.send(PeerEvent::Closed);
                    }
                })
            },
        ));

        let handle = Handle::current();
        let capacity = self.track_queue_capacity;
        let track_session = session_id.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, transceiver| {
            let events = events_tx.clone();
            let handle = handle.clone();
            let cancel = cancel.child_token();
            let session_id = track_session.clone();
            Box::pin(async move {
                let mid = transceiver.mid().map(|mid| mid.to_string());
                let codec = track_codec(&track.codec());
                info!(
                    session_id = %session_id,
                    mid = ?mid,
                    codec = %codec.mime_type,
                    ssrc = track.ssrc(),
                    "Remote track arrived"
                );

                let (tx, source) = track_channel(capacity, handle);
                // The read loop must not run inside this callback, which
                // blocks further on_track deliveries until it returns
                tokio::spawn(forward_rtp(track, tx, cancel, session_id));

                let _ = events.send(PeerEvent::Track(IncomingTrack {
                    mid,
                    codec,
                    source: Box::new(source),
                }));
            })
        }));

        let peer = WebRtcPeer {
            peer_connection,
            session_id: session_id.clone(),
            ice_gathering_timeout: self.config.ice_gathering_timeout(),
        };
        Ok((Arc::new(peer), events_rx))
    }
}

struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    session_id: SessionId,
    ice_gathering_timeout: Duration,
}

fn negotiation(message: String) -> Error {
    Error::Pipeline(PipelineError::Negotiation(message))
}

#[async_trait]
impl IngestPeer for WebRtcPeer {
    async fn accept_offer(&self, offer_sdp: &str) -> Result<Answer> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| negotiation(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| negotiation(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| negotiation(format!("Failed to create answer: {}", e)))?;

        let mids = media_mids(&answer)?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| negotiation(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.ice_gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                session_id = %self.session_id,
                timeout_secs = self.ice_gathering_timeout.as_secs(),
                "ICE gathering incomplete, answering with candidates gathered so far"
            );
        }

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| negotiation("No local description after setting answer".to_string()))?;

        debug!(session_id = %self.session_id, tracks = mids.len(), "Created SDP answer");
        Ok(Answer {
            sdp: local_desc.sdp,
            mids,
        })
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        debug!(session_id = %self.session_id, "Setting remote description");

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| negotiation(format!("Failed to parse description: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to set remote description: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!(session_id = %self.session_id, "Closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close connection: {}", e)))
    }
}

/// `a=mid` of every media description in `desc`, in order
fn media_mids(desc: &RTCSessionDescription) -> Result<Vec<Option<String>>> {
    let parsed = desc
        .unmarshal()
        .map_err(|e| negotiation(format!("Failed to parse answer: {}", e)))?;
    Ok(parsed
        .media_descriptions
        .iter()
        .map(|md| md.attribute("mid").flatten().map(|mid| mid.to_string()))
        .collect())
}

fn track_codec(params: &RTCRtpCodecParameters) -> TrackCodec {
    TrackCodec::new(
        params.capability.mime_type.clone(),
        params.capability.clock_rate,
        params.payload_type,
    )
    .with_channels(params.capability.channels)
    .with_fmtp(params.capability.sdp_fmtp_line.clone())
}

/// Pump RTP from the remote track into its bounded queue until the track
/// ends, the demuxer drops the queue, or the session is cancelled
async fn forward_rtp(
    track: Arc<TrackRemote>,
    tx: mpsc::Sender<RtpPacket>,
    cancel: CancellationToken,
    session_id: SessionId,
) {
    let ssrc = track.ssrc();
    let mut forwarded = 0u64;
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    debug!(session_id = %session_id, ssrc, error = %e, "Track read ended");
                    break;
                }
            },
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(packet) => sent,
        };
        if sent.is_err() {
            break;
        }
        forwarded += 1;
        if forwarded % 1000 == 0 {
            trace!(session_id = %session_id, ssrc, forwarded, "Forwarding RTP");
        }
    }
    debug!(session_id = %session_id, ssrc, forwarded, "Track forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_TRACK_ANSWER: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_media_mids_in_sdp_order() {
        let desc = RTCSessionDescription::answer(TWO_TRACK_ANSWER.to_string()).unwrap();
        let mids = media_mids(&desc).unwrap();
        assert_eq!(mids, vec![Some("0".to_string()), Some("1".to_string())]);
    }

    #[test]
    fn test_rtc_configuration_includes_turn() {
        let mut config = WebRtcConfig::default();
        config.turn_servers.push(crate::config::TurnServer {
            url: "turn:relay.example.com:3478".to_string(),
            username: "u".to_string(),
            credential: "p".to_string(),
        });
        let rtc = WebRtcPeerFactory::new(config, 8).rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[1].username, "u");
    }
}
