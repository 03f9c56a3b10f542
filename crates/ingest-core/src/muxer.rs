//! Synchronized multi-track muxer
//!
//! One pull loop per track feeds a single mux session. Loops run on their
//! own OS threads because demux pulls block on the network; every engine
//! call goes through one lock, since container interleaving assumes a
//! single writer.
//!
//! Lifecycle: `Building -> Running -> Draining -> Closed`. Building is
//! all-or-nothing and happens inside [`SynchronizedMuxer::build`]. The
//! header, the loops and the trailer are driven by a supervisor thread so
//! the caller can start draining the [`OutputStream`] right away.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::barrier::Track;
use crate::config::PipelineConfig;
use crate::demux::TrackDemuxer;
use crate::engine::{DemuxEngine, MuxEngine, MuxSession};
use crate::error::{Error, Result};
use crate::output::{output_relay, ChunkSink, OutputStream};
use crate::packet::MediaPacket;
use crate::time_base::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    Building,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for MuxerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxerState::Building => write!(f, "building"),
            MuxerState::Running => write!(f, "running"),
            MuxerState::Draining => write!(f, "draining"),
            MuxerState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxerStats {
    /// Packets written, indexed by output stream
    pub packets_written: Vec<u64>,
    /// Loops that ended on a demux or adapter error
    pub track_errors: u64,
    pub bytes_emitted: u64,
}

impl MuxerStats {
    pub fn total_packets(&self) -> u64 {
        self.packets_written.iter().sum()
    }
}

/// The single serialized entry point into the mux session
struct WritePath {
    session: Option<Box<dyn MuxSession>>,
    failed: bool,
}

struct Shared {
    write: Mutex<WritePath>,
    packets: Vec<AtomicU64>,
    track_errors: AtomicU64,
    fatal: Mutex<Option<String>>,
    cancel: CancellationToken,
    state: watch::Sender<MuxerState>,
}

impl Shared {
    fn write_packet(&self, packet: &MediaPacket) -> Result<()> {
        let mut write = self.write.lock();
        if write.failed {
            return Err(Error::MuxerClosed);
        }
        let session = write.session.as_mut().ok_or(Error::MuxerClosed)?;
        session.write_packet(packet).map_err(|e| {
            write.failed = true;
            into_fatal(e)
        })
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn MuxSession>) -> Result<T>,
    ) -> Result<T> {
        let mut write = self.write.lock();
        if write.failed {
            return Err(Error::MuxerClosed);
        }
        let session = write.session.as_mut().ok_or(Error::MuxerClosed)?;
        f(session).map_err(|e| {
            write.failed = true;
            into_fatal(e)
        })
    }

    /// Record the first fatal error and stop every loop.
    fn fail(&self, err: Error, sink: &ChunkSink) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_some() {
                return;
            }
            *fatal = Some(err.to_string());
        }
        error!(error = %err, "Muxer failed, tearing down");
        self.cancel.cancel();
        sink.fail(err);
    }

    fn set_state(&self, state: MuxerState) {
        let previous = self.state.send_replace(state);
        debug!(from = %previous, to = %state, "Muxer state change");
    }
}

fn into_fatal(err: Error) -> Error {
    match err {
        Error::EngineFatal(_) | Error::ConsumerGone => err,
        other => Error::EngineFatal(other.to_string()),
    }
}

pub struct SynchronizedMuxer {
    shared: Arc<Shared>,
    state: watch::Receiver<MuxerState>,
    bytes_emitted: Arc<AtomicU64>,
    supervisor: Option<JoinHandle<()>>,
}

impl SynchronizedMuxer {
    /// Build a muxer over `tracks` and start it.
    ///
    /// Opens one demux session per track concurrently and declares one
    /// output stream per track, using the track index as stream index. Any
    /// failure drops everything built so far. Blocks while demuxers probe,
    /// so call it from a blocking context.
    pub fn build(
        tracks: Vec<Track>,
        demux_engine: &dyn DemuxEngine,
        mux_engine: &dyn MuxEngine,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, OutputStream)> {
        if tracks.is_empty() {
            return Err(Error::Negotiation("no tracks to mux".to_string()));
        }
        if let Some((position, track)) = tracks
            .iter()
            .enumerate()
            .find(|(position, track)| *position != track.index)
        {
            return Err(Error::Negotiation(format!(
                "track {} found at position {}",
                track.index, position
            )));
        }

        let demuxers = open_demuxers(tracks, demux_engine, config)?;

        let (sink, stream) = output_relay(config.relay_capacity);
        let mut session = mux_engine.open(sink.clone())?;

        for demuxer in &demuxers {
            let index = session.add_stream(demuxer.params(), demuxer.time_base())?;
            if index != demuxer.index() {
                return Err(Error::Engine(format!(
                    "engine assigned stream index {} to track {}",
                    index,
                    demuxer.index()
                )));
            }
        }

        info!(
            tracks = demuxers.len(),
            format = mux_engine.format_name(),
            "Muxer built"
        );

        let (state_tx, state_rx) = watch::channel(MuxerState::Building);
        let shared = Arc::new(Shared {
            write: Mutex::new(WritePath {
                session: Some(session),
                failed: false,
            }),
            packets: demuxers.iter().map(|_| AtomicU64::new(0)).collect(),
            track_errors: AtomicU64::new(0),
            fatal: Mutex::new(None),
            cancel,
            state: state_tx,
        });

        let span = Span::current();
        let supervisor = {
            let shared = Arc::clone(&shared);
            let sink = sink.clone();
            thread::Builder::new()
                .name("muxer".to_string())
                .spawn(move || {
                    let _entered = span.enter();
                    supervise(shared, demuxers, sink);
                })?
        };

        Ok((
            Self {
                shared,
                state: state_rx,
                bytes_emitted: sink.byte_counter(),
                supervisor: Some(supervisor),
            },
            stream,
        ))
    }

    pub fn state(&self) -> MuxerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> MuxerStats {
        MuxerStats {
            packets_written: self
                .shared
                .packets
                .iter()
                .map(|p| p.load(Ordering::Relaxed))
                .collect(),
            track_errors: self.shared.track_errors.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
        }
    }

    /// Ask every loop to stop at its next pull; the trailer is still written.
    pub fn shutdown(&self) -> Result<()> {
        if self.state() == MuxerState::Closed {
            return Err(Error::MuxerClosed);
        }
        self.shared.cancel.cancel();
        Ok(())
    }

    /// Wait until the muxer is closed and report how it ended.
    pub async fn wait(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == MuxerState::Closed)
            .await
            .map_err(|_| Error::Internal("muxer state channel closed".to_string()))?;
        self.outcome()
    }

    /// Blocking variant of [`wait`](Self::wait).
    pub fn join(mut self) -> Result<()> {
        if let Some(handle) = self.supervisor.take() {
            handle
                .join()
                .map_err(|_| Error::Internal("muxer supervisor panicked".to_string()))?;
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<()> {
        match self.shared.fatal.lock().as_ref() {
            Some(message) => Err(Error::EngineFatal(message.clone())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SynchronizedMuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedMuxer")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

fn open_demuxers(
    tracks: Vec<Track>,
    engine: &dyn DemuxEngine,
    config: &PipelineConfig,
) -> Result<Vec<TrackDemuxer>> {
    let span = Span::current();
    let results: Vec<Result<TrackDemuxer>> = thread::scope(|scope| {
        let handles: Vec<_> = tracks
            .into_iter()
            .map(|track| {
                let span = span.clone();
                let index = track.index;
                thread::Builder::new()
                    .name(format!("demux-open-{}", index))
                    .spawn_scoped(scope, move || {
                        let _entered = span.enter();
                        TrackDemuxer::open(track, engine, config)
                    })
                    .map_err(Error::from)
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Internal("demux open panicked".to_string()))),
                Err(e) => Err(e),
            })
            .collect()
    });

    results.into_iter().collect()
}

fn supervise(shared: Arc<Shared>, demuxers: Vec<TrackDemuxer>, sink: ChunkSink) {
    let started = shared.with_session(|session| {
        session.write_header()?;
        demuxers
            .iter()
            .map(|d| session.stream_time_base(d.index()))
            .collect::<Result<Vec<Rational>>>()
    });

    let output_time_bases = match started {
        Ok(time_bases) => time_bases,
        Err(e) => {
            shared.fail(e, &sink);
            finish(&shared);
            return;
        }
    };

    shared.set_state(MuxerState::Running);

    let span = Span::current();
    let mut loops = Vec::with_capacity(demuxers.len());
    for (demuxer, output_tb) in demuxers.into_iter().zip(output_time_bases) {
        let index = demuxer.index();
        let shared_for_loop = Arc::clone(&shared);
        let sink_for_loop = sink.clone();
        let span = span.clone();
        let spawned = thread::Builder::new()
            .name(format!("track-{}", index))
            .spawn(move || {
                let _entered = span.enter();
                pull_loop(&shared_for_loop, demuxer, output_tb, &sink_for_loop);
            });
        match spawned {
            Ok(handle) => loops.push(handle),
            Err(e) => {
                shared.fail(Error::Internal(format!("spawn track loop: {}", e)), &sink);
                break;
            }
        }
    }

    for handle in loops {
        if handle.join().is_err() {
            shared.fail(Error::Internal("track loop panicked".to_string()), &sink);
        }
    }

    shared.set_state(MuxerState::Draining);

    if shared.fatal.lock().is_none() {
        match shared.with_session(|session| session.write_trailer()) {
            Ok(()) => info!(bytes = sink.bytes_sent(), "Muxer finalized"),
            Err(e) => shared.fail(e, &sink),
        }
    }

    finish(&shared);
}

/// Release the mux session (and with it the engine's sink) and mark closed.
fn finish(shared: &Shared) {
    let session = shared.write.lock().session.take();
    drop(session);
    shared.set_state(MuxerState::Closed);
}

fn pull_loop(shared: &Shared, mut demuxer: TrackDemuxer, output_tb: Rational, sink: &ChunkSink) {
    let index = demuxer.index();
    debug!(track = index, time_base = %output_tb, "Track loop started");

    loop {
        if shared.cancel.is_cancelled() {
            debug!(track = index, "Track loop cancelled");
            break;
        }

        let mut packet = match demuxer.next() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => {
                shared.track_errors.fetch_add(1, Ordering::Relaxed);
                warn!(track = index, error = %e, "Track loop stopped on demux error");
                break;
            }
        };

        packet.stream_index = index;
        packet.rescale(output_tb);
        packet.position = None;

        match shared.write_packet(&packet) {
            Ok(()) => {
                shared.packets[index].fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::MuxerClosed) => break,
            Err(e) => {
                shared.fail(e, sink);
                break;
            }
        }
    }

    debug!(
        track = index,
        packets = shared.packets[index].load(Ordering::Relaxed),
        "Track loop finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TrackCodec;
    use crate::engine::loopback::{parse_records, LoopbackDemux, LoopbackMux, Record, SyntheticSource};
    use std::io::Read;

    fn tracks(sources: Vec<(TrackCodec, SyntheticSource)>) -> Vec<Track> {
        sources
            .into_iter()
            .enumerate()
            .map(|(index, (codec, source))| Track::new(index, codec, Box::new(source)))
            .collect()
    }

    fn drain(mut stream: OutputStream) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_single_track_round_trip() {
        let tracks = tracks(vec![(
            TrackCodec::opus(),
            SyntheticSource::new(1, 20).with_timestamp_step(960),
        )]);
        let (muxer, stream) = SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        let records = parse_records(&drain(stream).unwrap()).unwrap();
        assert!(matches!(records.first(), Some(Record::Header { streams: 1 })));
        assert!(matches!(records.last(), Some(Record::Trailer { packets: 20 })));

        let pts: Vec<i64> = records
            .iter()
            .filter_map(|r| match r {
                Record::Packet { pts, .. } => *pts,
                _ => None,
            })
            .collect();
        let expected: Vec<i64> = (0..20).map(|i| i * 1_800).collect();
        assert_eq!(pts, expected);

        assert_eq!(muxer.stats().packets_written, vec![20]);
        muxer.join().unwrap();
    }

    #[test]
    fn test_misordered_tracks_rejected() {
        let tracks = vec![Track::new(
            1,
            TrackCodec::opus(),
            Box::new(SyntheticSource::new(1, 1)),
        )];
        let result = SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Negotiation(_))));
    }

    #[test]
    fn test_one_bad_track_fails_whole_build() {
        let tracks = tracks(vec![
            (TrackCodec::opus(), SyntheticSource::new(1, 10)),
            (TrackCodec::new("video/x-mystery", 90_000, 99), SyntheticSource::new(2, 10)),
        ]);
        let result = SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::UnsupportedPayload(_))));
    }

    #[test]
    fn test_header_failure_reaches_reader() {
        let tracks = tracks(vec![(TrackCodec::vp8(), SyntheticSource::new(1, 10))]);
        let (muxer, stream) = SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default().fail_header(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        let err = drain(stream).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        assert!(matches!(muxer.join(), Err(Error::EngineFatal(_))));
    }

    #[test]
    fn test_state_reaches_closed() {
        let tracks = tracks(vec![(TrackCodec::vp8(), SyntheticSource::new(1, 3))]);
        let (muxer, stream) = SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();
        drain(stream).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(muxer.wait()).unwrap();
        assert_eq!(muxer.state(), MuxerState::Closed);
        assert!(matches!(muxer.shutdown(), Err(Error::MuxerClosed)));
    }
}
