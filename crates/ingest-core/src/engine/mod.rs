//! Media container engine seams
//!
//! The pipeline never touches container bytes itself. A demux engine turns an
//! adapter's RTP byte stream into packets for one stream; a mux engine
//! accepts packets for N streams and pushes container bytes into a
//! [`ChunkSink`].

use crate::adapter::ByteStreamAdapter;
use crate::codec::{CodecParameters, PayloadFormat, StreamInfo};
use crate::error::Result;
use crate::output::ChunkSink;
use crate::packet::MediaPacket;
use crate::time_base::Rational;

#[cfg(any(test, feature = "test-util"))]
pub mod loopback;

/// Factory for per-track demux sessions
pub trait DemuxEngine: Send + Sync {
    /// Open a session reading from `input`.
    ///
    /// Blocks until the engine has probed enough packets to report the
    /// stream's parameters. Fails on an unusable payload format, a probe
    /// timeout from the adapter, or any engine setup error.
    fn open(&self, format: &PayloadFormat, input: ByteStreamAdapter)
        -> Result<Box<dyn DemuxSession>>;
}

/// Demuxer for the single stream carried by one track
pub trait DemuxSession: Send {
    fn stream(&self) -> &StreamInfo;

    /// Next packet, `Ok(None)` at end of stream.
    ///
    /// Packet timestamps are in `stream().time_base`.
    fn read_packet(&mut self) -> Result<Option<MediaPacket>>;
}

/// Factory for output container sessions
pub trait MuxEngine: Send + Sync {
    /// Container format name, for logs
    fn format_name(&self) -> &str;

    fn open(&self, sink: ChunkSink) -> Result<Box<dyn MuxSession>>;
}

/// One output container.
///
/// Calls are not thread-safe; callers serialize every access.
pub trait MuxSession: Send {
    /// Declare an output stream; returns its index.
    ///
    /// `time_base` is a hint, the engine may pick its own once the header
    /// is written.
    fn add_stream(&mut self, params: &CodecParameters, time_base: Rational) -> Result<usize>;

    fn write_header(&mut self) -> Result<()>;

    /// Time base of an output stream, final only after `write_header`.
    fn stream_time_base(&self, index: usize) -> Result<Rational>;

    /// Write one packet whose timestamps are already in the stream's
    /// output time base.
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()>;

    fn write_trailer(&mut self) -> Result<()>;
}
