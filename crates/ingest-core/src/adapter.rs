//! Byte-stream adapter between a live packet source and a container engine
//!
//! Container engines pull bytes through a read callback and may probe a
//! write callback for an RTCP back-channel. The adapter answers each read
//! with exactly one serialized RTP packet and swallows every write.

use std::time::Duration;

use tracing::{debug, warn};
use webrtc::util::Marshal;

use crate::config::PipelineConfig;
use crate::source::{PacketSource, SourceError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("end of stream")]
    EndOfStream,

    #[error("packet source failed: {0}")]
    Io(String),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("packet of {packet_len} bytes exceeds {buffer_len} byte buffer")]
    Overflow { packet_len: usize, buffer_len: usize },

    #[error("no packet before probe deadline")]
    Timeout,
}

/// Counters for one adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub packets: u64,
    pub bytes: u64,
    /// Sequence discontinuities observed
    pub gaps: u64,
    pub overflows: u64,
    /// Bytes written to the back-channel and discarded
    pub discarded: u64,
}

pub struct ByteStreamAdapter {
    source: Box<dyn PacketSource>,
    track: usize,
    buffer_size: usize,
    probe_timeout: Duration,
    last_seq: Option<u16>,
    stats: AdapterStats,
}

impl ByteStreamAdapter {
    pub fn new(source: Box<dyn PacketSource>, track: usize, config: &PipelineConfig) -> Self {
        Self {
            source,
            track,
            buffer_size: config.read_buffer_size,
            probe_timeout: config.probe_timeout,
            last_seq: None,
            stats: AdapterStats::default(),
        }
    }

    pub fn track(&self) -> usize {
        self.track
    }

    /// Size of the read buffer an engine should allocate
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Copy the next serialized packet into `buf`.
    ///
    /// Until the first packet is delivered the wait is bounded by the probe
    /// timeout. A packet that does not fit is dropped whole and reported as
    /// [`AdapterError::Overflow`]; `buf` is left untouched.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        let timeout = (self.stats.packets == 0).then_some(self.probe_timeout);

        let packet = match self.source.recv(timeout) {
            Ok(Some(packet)) => packet,
            Ok(None) | Err(SourceError::Closed) => {
                debug!(track = self.track, packets = self.stats.packets, "Packet source exhausted");
                return Err(AdapterError::EndOfStream);
            }
            Err(SourceError::Timeout) => return Err(AdapterError::Timeout),
            Err(SourceError::Transport(e)) => return Err(AdapterError::Io(e)),
        };

        let seq = packet.header.sequence_number;
        if let Some(prev) = self.last_seq {
            if prev.wrapping_add(1) != seq {
                self.stats.gaps += 1;
                warn!(track = self.track, prev, seq, "lost packets");
            }
        }
        self.last_seq = Some(seq);

        let raw = packet
            .marshal()
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        if raw.len() > buf.len() {
            self.stats.overflows += 1;
            return Err(AdapterError::Overflow {
                packet_len: raw.len(),
                buffer_len: buf.len(),
            });
        }

        buf[..raw.len()].copy_from_slice(&raw);
        self.stats.packets += 1;
        self.stats.bytes += raw.len() as u64;
        Ok(raw.len())
    }

    /// Accept and discard a back-channel write.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        self.stats.discarded += buf.len() as u64;
        buf.len()
    }
}

impl std::fmt::Debug for ByteStreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamAdapter")
            .field("track", &self.track)
            .field("buffer_size", &self.buffer_size)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    struct ScriptSource {
        items: VecDeque<Result<Option<Packet>, SourceError>>,
        timeouts: Vec<Option<Duration>>,
    }

    impl PacketSource for ScriptSource {
        fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, SourceError> {
            self.timeouts.push(timeout);
            self.items.pop_front().unwrap_or(Ok(None))
        }
    }

    fn packet(seq: u16, payload_len: usize) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 111,
                sequence_number: seq,
                timestamp: seq as u32 * 960,
                ssrc: 0x1234,
                ..Default::default()
            },
            payload: Bytes::from(vec![0xAB; payload_len]),
        }
    }

    fn adapter(items: Vec<Result<Option<Packet>, SourceError>>) -> ByteStreamAdapter {
        let source = ScriptSource {
            items: items.into(),
            timeouts: Vec::new(),
        };
        ByteStreamAdapter::new(Box::new(source), 0, &PipelineConfig::default())
    }

    #[test]
    fn test_read_one_packet_per_call() {
        let mut adapter = adapter(vec![Ok(Some(packet(1, 100))), Ok(Some(packet(2, 50)))]);
        let mut buf = vec![0u8; 1500];

        assert_eq!(adapter.read(&mut buf).unwrap(), 112);
        assert_eq!(&buf[12..112], &[0xAB; 100][..]);
        assert_eq!(adapter.read(&mut buf).unwrap(), 62);
        assert_eq!(adapter.read(&mut buf), Err(AdapterError::EndOfStream));

        let stats = adapter.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes, 174);
        assert_eq!(stats.gaps, 0);
    }

    #[test]
    fn test_oversized_packet_overflows_without_partial_copy() {
        let mut adapter = adapter(vec![Ok(Some(packet(1, 2000)))]);
        let mut buf = vec![0u8; 1500];

        let err = adapter.read(&mut buf).unwrap_err();
        assert_eq!(
            err,
            AdapterError::Overflow {
                packet_len: 2012,
                buffer_len: 1500
            }
        );
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(adapter.stats().overflows, 1);
    }

    #[test]
    fn test_transport_failure_is_distinct_from_end_of_stream() {
        let mut adapter = adapter(vec![Err(SourceError::Transport("reset".to_string()))]);
        let mut buf = vec![0u8; 1500];
        assert_eq!(
            adapter.read(&mut buf),
            Err(AdapterError::Io("reset".to_string()))
        );

        let mut adapter = adapter_closed();
        assert_eq!(adapter.read(&mut buf), Err(AdapterError::EndOfStream));
    }

    fn adapter_closed() -> ByteStreamAdapter {
        adapter(vec![Err(SourceError::Closed)])
    }

    #[test]
    fn test_sequence_gap_is_counted_not_fatal() {
        let mut adapter = adapter(vec![
            Ok(Some(packet(65_534, 10))),
            Ok(Some(packet(65_535, 10))),
            Ok(Some(packet(0, 10))),
            Ok(Some(packet(5, 10))),
        ]);
        let mut buf = vec![0u8; 1500];
        for _ in 0..4 {
            assert!(adapter.read(&mut buf).is_ok());
        }
        assert_eq!(adapter.stats().gaps, 1);
        assert_eq!(adapter.stats().packets, 4);
    }

    #[test]
    fn test_probe_timeout_only_before_first_packet() {
        let source = ScriptSource {
            items: vec![Ok(Some(packet(1, 10))), Ok(Some(packet(2, 10)))].into(),
            timeouts: Vec::new(),
        };
        let mut config = PipelineConfig::default();
        config.probe_timeout = Duration::from_millis(250);

        // Keep a raw view of the recorded timeouts via a shared wrapper
        struct Recorder(std::sync::Arc<parking_lot::Mutex<ScriptSource>>);
        impl PacketSource for Recorder {
            fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>, SourceError> {
                self.0.lock().recv(timeout)
            }
        }

        let shared = std::sync::Arc::new(parking_lot::Mutex::new(source));
        let mut adapter = ByteStreamAdapter::new(Box::new(Recorder(shared.clone())), 3, &config);
        let mut buf = vec![0u8; 1500];
        adapter.read(&mut buf).unwrap();
        adapter.read(&mut buf).unwrap();

        assert_eq!(
            shared.lock().timeouts,
            vec![Some(Duration::from_millis(250)), None]
        );
    }

    #[test]
    fn test_probe_timeout_surfaces() {
        let mut adapter = adapter(vec![Err(SourceError::Timeout)]);
        let mut buf = vec![0u8; 1500];
        assert_eq!(adapter.read(&mut buf), Err(AdapterError::Timeout));
    }

    #[test]
    fn test_write_is_discarded() {
        let mut adapter = adapter(vec![]);
        assert_eq!(adapter.write(&[1, 2, 3, 4]), 4);
        assert_eq!(adapter.stats().discarded, 4);
    }
}
