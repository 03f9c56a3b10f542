//! Per-track demux instance

use tracing::{debug, info};

use crate::adapter::ByteStreamAdapter;
use crate::barrier::Track;
use crate::codec::{CodecParameters, PayloadFormat, StreamInfo};
use crate::config::PipelineConfig;
use crate::engine::{DemuxEngine, DemuxSession};
use crate::error::Result;
use crate::packet::MediaPacket;
use crate::time_base::Rational;

/// One negotiated track behind a demux session.
///
/// Owned by exactly one pull loop.
pub struct TrackDemuxer {
    index: usize,
    session: Box<dyn DemuxSession>,
    packets: u64,
    finished: bool,
}

impl TrackDemuxer {
    pub fn open(track: Track, engine: &dyn DemuxEngine, config: &PipelineConfig) -> Result<Self> {
        let Track {
            index,
            codec,
            source,
        } = track;

        let format = PayloadFormat::from_codec(&codec)?;
        debug!(track = index, mime_type = %codec.mime_type, "Opening demux session");

        let adapter = ByteStreamAdapter::new(source, index, config);
        let session = engine.open(&format, adapter)?;

        let stream = session.stream();
        info!(
            track = index,
            codec = ?stream.params.codec,
            time_base = %stream.time_base,
            "Track demuxer ready"
        );

        Ok(Self {
            index,
            session,
            packets: 0,
            finished: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn params(&self) -> &CodecParameters {
        &self.stream().params
    }

    pub fn time_base(&self) -> Rational {
        self.stream().time_base
    }

    fn stream(&self) -> &StreamInfo {
        self.session.stream()
    }

    pub fn packets_read(&self) -> u64 {
        self.packets
    }

    /// Next packet stamped with this track's index and input time base.
    ///
    /// End of stream is sticky: every later call returns `Ok(None)`.
    pub fn next(&mut self) -> Result<Option<MediaPacket>> {
        if self.finished {
            return Ok(None);
        }

        match self.session.read_packet()? {
            Some(mut packet) => {
                packet.stream_index = self.index;
                packet.time_base = self.session.stream().time_base;
                self.packets += 1;
                Ok(Some(packet))
            }
            None => {
                self.finished = true;
                debug!(track = self.index, packets = self.packets, "Track reached end of stream");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for TrackDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackDemuxer")
            .field("index", &self.index)
            .field("packets", &self.packets)
            .field("finished", &self.finished)
            .finish()
    }
}
