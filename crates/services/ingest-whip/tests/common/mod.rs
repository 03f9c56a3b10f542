//! Shared fixtures: a scripted peer factory and a collecting consumer
#![allow(dead_code)]

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use whip_mpegts_core::engine::loopback::{LoopbackDemux, LoopbackMux, SyntheticSource};
use whip_mpegts_core::{Error as PipelineError, OutputStream, TrackCodec};
use whip_mpegts_server::config::Config;
use whip_mpegts_server::consumer::StreamConsumer;
use whip_mpegts_server::peer::{Answer, IncomingTrack, IngestPeer, PeerEvent, PeerEvents, PeerFactory};
use whip_mpegts_server::session::{SessionId, SessionManager};
use whip_mpegts_server::{Error, Result};

pub const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// An offer the fake peer refuses
pub const BAD_OFFER: &str = "not an sdp";

#[derive(Debug, Clone)]
pub struct FakeTrack {
    pub mid: Option<String>,
    pub ssrc: u32,
    pub packets: u64,
    pub interval: Option<Duration>,
}

impl FakeTrack {
    pub fn new(mid: &str, ssrc: u32, packets: u64) -> Self {
        Self {
            mid: Some(mid.to_string()),
            ssrc,
            packets,
            interval: None,
        }
    }

    pub fn paced(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Counters shared by every peer a factory created
#[derive(Debug, Default)]
pub struct PeerLog {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub remote_updates: AtomicUsize,
}

pub struct FakePeerFactory {
    mids: Vec<Option<String>>,
    tracks: Vec<FakeTrack>,
    pub log: Arc<PeerLog>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    /// Answer with these media sections and deliver these tracks
    pub fn new(mids: &[&str], tracks: Vec<FakeTrack>) -> Self {
        Self {
            mids: mids.iter().map(|m| Some(m.to_string())).collect(),
            tracks,
            log: Arc::new(PeerLog::default()),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Simulate the remote side closing the most recent peer
    pub fn disconnect_last(&self) {
        if let Some(peer) = self.peers.lock().last() {
            if let Some(tx) = peer.events.lock().as_ref() {
                let _ = tx.send(PeerEvent::Closed);
            }
        }
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _session_id: &SessionId,
        _cancel: CancellationToken,
    ) -> Result<(Arc<dyn IngestPeer>, PeerEvents)> {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            mids: self.mids.clone(),
            tracks: self.tracks.clone(),
            events: Mutex::new(Some(tx)),
            log: Arc::clone(&self.log),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok((peer, rx))
    }
}

pub struct FakePeer {
    mids: Vec<Option<String>>,
    tracks: Vec<FakeTrack>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    log: Arc<PeerLog>,
}

#[async_trait]
impl IngestPeer for FakePeer {
    async fn accept_offer(&self, offer_sdp: &str) -> Result<Answer> {
        if !offer_sdp.starts_with("v=0") {
            return Err(Error::Pipeline(PipelineError::Negotiation(
                "Failed to parse offer".to_string(),
            )));
        }

        if let Some(tx) = self.events.lock().as_ref() {
            for track in &self.tracks {
                let mut source = SyntheticSource::new(track.ssrc, track.packets)
                    .with_payload_type(111)
                    .with_timestamp_step(960);
                if let Some(interval) = track.interval {
                    source = source.with_interval(interval);
                }
                let _ = tx.send(PeerEvent::Track(IncomingTrack {
                    mid: track.mid.clone(),
                    codec: TrackCodec::opus(),
                    source: Box::new(source),
                }));
            }
        }

        Ok(Answer {
            sdp: format!("{}a=fake-answer\r\n", OFFER),
            mids: self.mids.clone(),
        })
    }

    async fn set_remote_description(&self, _sdp: &str) -> Result<()> {
        self.log.remote_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        self.events.lock().take();
        Ok(())
    }
}

/// Consumer that drains each stream and reports `(session, bytes)`
pub fn collecting_consumer() -> (
    Arc<dyn StreamConsumer>,
    mpsc::UnboundedReceiver<(SessionId, std::io::Result<Vec<u8>>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer: Arc<dyn StreamConsumer> =
        Arc::new(move |id: &SessionId, mut stream: OutputStream| {
            let mut data = Vec::new();
            let result = stream.read_to_end(&mut data).map(|_| data);
            let _ = tx.send((id.clone(), result));
        });
    (consumer, rx)
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.barrier_timeout_secs = 1;
    config.pipeline.probe_timeout_secs = 1;
    config
}

pub fn manager(
    config: &Config,
    factory: Arc<FakePeerFactory>,
    consumer: Arc<dyn StreamConsumer>,
) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        config,
        factory,
        Arc::new(LoopbackDemux),
        Arc::new(LoopbackMux::default()),
        consumer,
    ))
}

/// Poll until the registry is empty or `timeout` passes
pub async fn wait_until_empty(manager: &SessionManager, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if manager.session_count().await == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
