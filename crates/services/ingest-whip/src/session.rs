//! Session management for WHIP ingest
//!
//! A session moves `Created → Negotiating → Active → Closed`. The answer is
//! returned while the session is still negotiating; a background task waits
//! for every negotiated track, builds the muxer and hands its output stream
//! to the configured consumer.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use whip_mpegts_core::engine::{DemuxEngine, MuxEngine};
use whip_mpegts_core::{
    Error as PipelineError, MuxerState, MuxerStats, PipelineConfig, SynchronizedMuxer, Track,
    TrackBarrier, TrackRegistrar,
};

use crate::config::Config;
use crate::consumer::StreamConsumer;
use crate::error::{Error, Result};
use crate::metrics::global_metrics;
use crate::peer::{IngestPeer, PeerEvent, PeerEvents, PeerFactory, TrackSlots};

/// How long shutdown waits for each muxer to write its trailer
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque session identifier, also the last path segment of the WHIP resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session state enum
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Peer connection created, offer not yet answered
    Created,

    /// Answer sent, waiting for every negotiated track
    Negotiating,

    /// Muxer running, stream handed to the consumer
    Active {
        activated_at: SystemTime,
    },

    Closed {
        reason: EndReason,
    },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Active { .. } => "active",
            SessionState::Closed { .. } => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed { reason } => write!(f, "closed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Reason for session ending
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Explicit WHIP DELETE
    Deleted,

    /// Peer connection failed or was closed remotely
    PeerClosed,

    /// The stream consumer returned
    StreamFinished,

    /// Negotiation, barrier, build or muxing failure
    Failed(String),

    /// Gateway shutdown
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Deleted => write!(f, "deleted"),
            EndReason::PeerClosed => write!(f, "peer_closed"),
            EndReason::StreamFinished => write!(f, "stream_finished"),
            EndReason::Failed(e) => write!(f, "failed: {}", e),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Result of a successful WHIP POST
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: SessionId,
    pub answer_sdp: String,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: SystemTime,
    /// Media descriptions in the answer
    pub tracks: usize,
    /// Present once the muxer is running
    pub muxer: Option<MuxerStats>,
}

/// An ingest session
pub struct IngestSession {
    pub id: SessionId,
    pub created_at: SystemTime,
    tracks: usize,
    state: RwLock<SessionState>,
    peer: Arc<dyn IngestPeer>,
    /// Parent of the muxer token and of every track forwarder token
    cancel: CancellationToken,
    muxer: parking_lot::Mutex<Option<Arc<SynchronizedMuxer>>>,
}

impl IngestSession {
    fn new(
        id: SessionId,
        tracks: usize,
        peer: Arc<dyn IngestPeer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            created_at: SystemTime::now(),
            tracks,
            state: RwLock::new(SessionState::Created),
            peer,
            cancel,
            muxer: parking_lot::Mutex::new(None),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks
    }

    pub fn muxer_stats(&self) -> Option<MuxerStats> {
        self.muxer.lock().as_ref().map(|m| m.stats())
    }

    async fn set_negotiating(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            SessionState::Created => {
                *state = SessionState::Negotiating;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: state.label().to_string(),
                to: "negotiating".to_string(),
            }),
        }
    }

    async fn activate(&self, muxer: Arc<SynchronizedMuxer>) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            SessionState::Negotiating => {
                *self.muxer.lock() = Some(muxer);
                *state = SessionState::Active {
                    activated_at: SystemTime::now(),
                };
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: state.label().to_string(),
                to: "active".to_string(),
            }),
        }
    }

    /// Mark the session closed and cancel everything it owns.
    ///
    /// Returns false if it was already closed.
    async fn end(&self, reason: EndReason) -> bool {
        let mut state = self.state.write().await;
        if state.is_closed() {
            return false;
        }
        *state = SessionState::Closed { reason };
        self.cancel.cancel();
        true
    }

    async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state().await,
            created_at: self.created_at,
            tracks: self.tracks,
            muxer: self.muxer_stats(),
        }
    }
}

/// Session manager for tracking all active sessions
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<IngestSession>>>,
    max_sessions: usize,
    pipeline: PipelineConfig,
    peer_factory: Arc<dyn PeerFactory>,
    demux_engine: Arc<dyn DemuxEngine>,
    mux_engine: Arc<dyn MuxEngine>,
    consumer: Arc<dyn StreamConsumer>,
    /// Root of every session token; cancelled on shutdown
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        peer_factory: Arc<dyn PeerFactory>,
        demux_engine: Arc<dyn DemuxEngine>,
        mux_engine: Arc<dyn MuxEngine>,
        consumer: Arc<dyn StreamConsumer>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: config.limits.max_sessions,
            pipeline: config.pipeline.to_core(),
            peer_factory,
            demux_engine,
            mux_engine,
            consumer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Answer a WHIP offer and start waiting for its tracks.
    ///
    /// Nothing is registered if any step fails; the peer is closed.
    #[instrument(skip(self, offer_sdp), fields(offer_len = offer_sdp.len()))]
    pub async fn create_session(self: &Arc<Self>, offer_sdp: &str) -> Result<CreatedSession> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self.sessions.read().await.len() >= self.max_sessions {
            return Err(Error::MaxSessionsReached(self.max_sessions));
        }

        let id = SessionId::generate();
        let cancel = self.shutdown.child_token();

        let (peer, events) = match self.peer_factory.create(&id, cancel.clone()).await {
            Ok(created) => created,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        let setup = async {
            let answer = peer.accept_offer(offer_sdp).await?;
            let (registrar, barrier) = TrackBarrier::new(answer.track_count())?;
            Ok::<_, Error>((answer, registrar, barrier))
        };
        let (answer, registrar, barrier) = match setup.await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Offer rejected");
                discard_peer(&peer, &cancel).await;
                return Err(e);
            }
        };

        let session = Arc::new(IngestSession::new(
            id.clone(),
            answer.track_count(),
            Arc::clone(&peer),
            cancel.clone(),
        ));
        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.max_sessions {
                drop(sessions);
                discard_peer(&peer, &cancel).await;
                return Err(Error::MaxSessionsReached(self.max_sessions));
            }
            sessions.insert(id.clone(), Arc::clone(&session));
        }
        global_metrics().session_created();
        session.set_negotiating().await?;

        let slots = TrackSlots::new(answer.mids.clone());
        tokio::spawn(
            Arc::clone(self).route_peer_events(Arc::clone(&session), events, registrar, slots),
        );
        tokio::spawn(Arc::clone(self).negotiate(Arc::clone(&session), barrier));

        info!(session_id = %id, tracks = answer.track_count(), "Session created");
        Ok(CreatedSession {
            id,
            answer_sdp: answer.sdp,
        })
    }

    /// Route a WHIP PATCH to the session's peer connection.
    ///
    /// An active muxer is left untouched.
    #[instrument(skip(self, sdp))]
    pub async fn renegotiate(&self, id: &str, sdp: &str) -> Result<()> {
        let session = self
            .get_session(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if session.state().await.is_closed() {
            return Err(Error::NotFound(id.to_string()));
        }
        session.peer.set_remote_description(sdp).await?;
        debug!(session_id = %id, "Remote description updated");
        Ok(())
    }

    /// WHIP DELETE
    pub async fn terminate(&self, id: &str) -> Result<()> {
        self.close_session(id, EndReason::Deleted).await
    }

    pub async fn session_state(&self, id: &str) -> Result<SessionSnapshot> {
        let session = self
            .get_session(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(session.snapshot().await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<IngestSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.snapshot().await);
        }
        snapshots
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<IngestSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session and refuse new ones.
    ///
    /// Waits a bounded time for running muxers to write their trailers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        info!(sessions = ids.len(), "Closing all sessions");

        let mut muxers = Vec::new();
        for id in ids {
            if let Some(session) = self.get_session(id.as_str()).await {
                if let Some(muxer) = session.muxer.lock().clone() {
                    muxers.push(muxer);
                }
            }
            let _ = self.close_session(id.as_str(), EndReason::Shutdown).await;
        }

        for muxer in muxers {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, muxer.wait())
                .await
                .is_err()
            {
                warn!("Muxer did not finish before shutdown deadline");
            }
        }
    }

    /// Remove a session from the registry and release its peer
    async fn close_session(&self, id: &str, reason: EndReason) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !session.end(reason.clone()).await {
            return Err(Error::NotFound(id.to_string()));
        }
        if let Err(e) = session.peer.close().await {
            warn!(session_id = %id, error = %e, "Failed to close peer connection");
        }

        let metrics = global_metrics();
        metrics.session_ended();
        if matches!(reason, EndReason::Failed(_)) {
            metrics.session_failed();
        }
        info!(session_id = %id, reason = %reason, "Session closed");
        Ok(())
    }

    async fn fail(&self, id: &SessionId, err: Error) {
        warn!(session_id = %id, error = %err, "Session failed");
        if let Err(e) = self
            .close_session(id.as_str(), EndReason::Failed(err.to_string()))
            .await
        {
            debug!(session_id = %id, error = %e, "Session already gone");
        }
    }

    /// Turn peer events into barrier registrations until the session ends
    async fn route_peer_events(
        self: Arc<Self>,
        session: Arc<IngestSession>,
        mut events: PeerEvents,
        registrar: TrackRegistrar,
        mut slots: TrackSlots,
    ) {
        loop {
            let event = tokio::select! {
                _ = session.cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(PeerEvent::Track(track)) => {
                    let Some(index) = slots.assign(track.mid.as_deref()) else {
                        warn!(
                            session_id = %session.id,
                            mid = ?track.mid,
                            "Track outside the negotiated media sections, dropping"
                        );
                        continue;
                    };
                    debug!(
                        session_id = %session.id,
                        track = index,
                        remaining = slots.remaining(),
                        "Registering track"
                    );
                    if let Err(e) = registrar.register(Track::new(index, track.codec, track.source)) {
                        debug!(session_id = %session.id, track = index, error = %e, "Track not registered");
                    }
                }
                Some(PeerEvent::Closed) | None => {
                    if self
                        .close_session(session.id.as_str(), EndReason::PeerClosed)
                        .await
                        .is_ok()
                    {
                        info!(session_id = %session.id, "Peer connection closed remotely");
                    }
                    break;
                }
            }
        }
    }

    /// Barrier, build, consume, close
    async fn negotiate(self: Arc<Self>, session: Arc<IngestSession>, barrier: TrackBarrier) {
        let id = session.id.clone();

        let tracks = match barrier
            .await_all_or_cancel(self.pipeline.barrier_timeout, &session.cancel)
            .await
        {
            Ok(tracks) => tracks,
            Err(PipelineError::Cancelled) => return,
            Err(e) => {
                if matches!(e, PipelineError::BarrierTimeout { .. }) {
                    global_metrics().barrier_timed_out();
                }
                self.fail(&id, e.into()).await;
                return;
            }
        };

        let demux_engine = Arc::clone(&self.demux_engine);
        let mux_engine = Arc::clone(&self.mux_engine);
        let pipeline = self.pipeline.clone();
        let muxer_cancel = session.cancel.child_token();
        let built = tokio::task::spawn_blocking(move || {
            SynchronizedMuxer::build(
                tracks,
                demux_engine.as_ref(),
                mux_engine.as_ref(),
                &pipeline,
                muxer_cancel,
            )
        })
        .await;

        let (muxer, stream) = match built {
            Ok(Ok(built)) => built,
            Ok(Err(e)) => {
                self.fail(&id, e.into()).await;
                return;
            }
            Err(e) => {
                self.fail(&id, PipelineError::Internal(format!("muxer build panicked: {}", e)).into())
                    .await;
                return;
            }
        };
        let muxer = Arc::new(muxer);

        if let Err(e) = session.activate(Arc::clone(&muxer)).await {
            // Closed while the muxer was being built; its token is already cancelled
            debug!(session_id = %id, error = %e, "Session ended before activation");
            drop(stream);
            let _ = muxer.wait().await;
            return;
        }
        info!(session_id = %id, tracks = session.track_count(), "Session active");

        let consumer = Arc::clone(&self.consumer);
        let consumer_id = id.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || consumer.consume(&consumer_id, stream)).await
        {
            error!(session_id = %id, error = %e, "Stream consumer panicked");
        }

        // A muxer that already closed with a fatal error takes precedence
        let reason = match muxer.state() {
            MuxerState::Closed => match muxer.wait().await {
                Ok(()) => EndReason::StreamFinished,
                Err(e) => EndReason::Failed(e.to_string()),
            },
            _ => EndReason::StreamFinished,
        };
        if let Err(e) = self.close_session(id.as_str(), reason).await {
            debug!(session_id = %id, error = %e, "Session already closed");
        }

        let _ = muxer.wait().await;
        let stats = muxer.stats();
        global_metrics().muxer_finished(stats.total_packets(), stats.bytes_emitted);
        debug!(
            session_id = %id,
            packets = stats.total_packets(),
            bytes = stats.bytes_emitted,
            track_errors = stats.track_errors,
            "Muxer finished"
        );
    }
}

async fn discard_peer(peer: &Arc<dyn IngestPeer>, cancel: &CancellationToken) {
    cancel.cancel();
    if let Err(e) = peer.close().await {
        debug!(error = %e, "Failed to close rejected peer");
    }
}
