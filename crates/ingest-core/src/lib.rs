//! WHIP ingest to MPEG-TS pipeline core
//!
//! Turns a set of live, independently arriving RTP packet streams into one
//! interleaved container byte stream.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   register    ┌───────────────┐  await_all   ┌─────────────────────────┐
//! │ peer on_track │ ────────────▶ │ TrackBarrier  │ ───────────▶ │ SynchronizedMuxer::build│
//! └───────────────┘               └───────────────┘              └────────────┬────────────┘
//!                                                                             │ one TrackDemuxer per track
//!                                                                             ▼
//!   PacketSource ─▶ ByteStreamAdapter ─▶ DemuxSession ─▶ pull loop ─┐
//!   PacketSource ─▶ ByteStreamAdapter ─▶ DemuxSession ─▶ pull loop ─┼─▶ Mutex<MuxSession> ─▶ ChunkSink
//!   PacketSource ─▶ ByteStreamAdapter ─▶ DemuxSession ─▶ pull loop ─┘                          │
//!                                                                                              ▼
//!                                                                                        OutputStream
//! ```
//!
//! The container work itself is delegated to an engine behind the
//! [`engine::DemuxEngine`] and [`engine::MuxEngine`] traits.

pub mod adapter;
pub mod barrier;
pub mod codec;
pub mod config;
pub mod demux;
pub mod engine;
pub mod error;
pub mod muxer;
pub mod output;
pub mod packet;
pub mod source;
pub mod time_base;

pub use adapter::{AdapterError, AdapterStats, ByteStreamAdapter};
pub use barrier::{Track, TrackBarrier, TrackRegistrar};
pub use codec::{CodecId, CodecParameters, MediaKind, PayloadFormat, StreamInfo, TrackCodec};
pub use config::PipelineConfig;
pub use demux::TrackDemuxer;
pub use error::{Error, Result};
pub use muxer::{MuxerState, MuxerStats, SynchronizedMuxer};
pub use output::{output_relay, ChunkSink, OutputStream};
pub use packet::MediaPacket;
pub use source::{PacketSource, SourceError};
pub use time_base::Rational;

/// RTP packet type carried by every [`PacketSource`].
pub use webrtc::rtp::packet::Packet as RtpPacket;
