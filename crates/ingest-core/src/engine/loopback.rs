//! In-process loopback engine and synthetic packet sources
//!
//! The loopback demuxer reads RTP packets straight off the adapter and maps
//! RTP timestamps onto `1/clock_rate`. The loopback muxer writes a framed
//! record format where every packet record is pushed in two sink calls
//! (prefix, then payload), so any unserialized interleaving between writers
//! shows up as an unparsable stream.
//!
//! Record layout, all integers big-endian:
//!
//! ```text
//! header  : 'H' streams:u16
//! packet  : 'P' stream:u8 flags:u8 pts:i64 dts:i64 len:u32 payload[len]
//! trailer : 'T' packets:u64
//! ```

use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::adapter::{AdapterError, ByteStreamAdapter};
use crate::codec::{CodecParameters, MediaKind, PayloadFormat, StreamInfo};
use crate::engine::{DemuxEngine, DemuxSession, MuxEngine, MuxSession};
use crate::error::{Error, Result};
use crate::output::ChunkSink;
use crate::packet::MediaPacket;
use crate::source::{PacketSource, SourceError};
use crate::time_base::Rational;

const TAG_HEADER: u8 = b'H';
const TAG_PACKET: u8 = b'P';
const TAG_TRAILER: u8 = b'T';

const FLAG_PTS: u8 = 0x01;
const FLAG_DTS: u8 = 0x02;
const FLAG_KEY: u8 = 0x04;

const PACKET_PREFIX_LEN: usize = 1 + 1 + 1 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackDemux;

impl DemuxEngine for LoopbackDemux {
    fn open(
        &self,
        format: &PayloadFormat,
        input: ByteStreamAdapter,
    ) -> Result<Box<dyn DemuxSession>> {
        let params = match format.kind {
            MediaKind::Audio => {
                CodecParameters::audio(format.codec, format.clock_rate, format.channels.max(1))
            }
            MediaKind::Video => CodecParameters::video(format.codec, 0, 0),
        };
        let stream = StreamInfo {
            params,
            time_base: format.time_base(),
        };

        let mut session = LoopbackDemuxSession {
            buf: vec![0u8; input.buffer_size()],
            input,
            stream,
            first_timestamp: None,
            probed: None,
        };

        // Probe: the first packet must arrive before the adapter's deadline
        match session.read_rtp() {
            Ok(packet) => {
                let packet = session.to_media_packet(packet);
                session.probed = Some(packet);
            }
            Err(e) => return Err(Error::Engine(format!("probe failed: {}", e))),
        }

        Ok(Box::new(session))
    }
}

struct LoopbackDemuxSession {
    input: ByteStreamAdapter,
    buf: Vec<u8>,
    stream: StreamInfo,
    first_timestamp: Option<u32>,
    probed: Option<MediaPacket>,
}

impl LoopbackDemuxSession {
    fn read_rtp(&mut self) -> std::result::Result<Packet, AdapterError> {
        let n = self.input.read(&mut self.buf)?;
        let mut raw = &self.buf[..n];
        Packet::unmarshal(&mut raw).map_err(|e| AdapterError::Malformed(e.to_string()))
    }

    fn to_media_packet(&mut self, rtp: Packet) -> MediaPacket {
        let ts = rtp.header.timestamp;
        let first = *self.first_timestamp.get_or_insert(ts);
        let pts = ts.wrapping_sub(first) as i64;

        let mut packet = MediaPacket::new(self.input.track(), rtp.payload, self.stream.time_base)
            .with_timestamps(Some(pts), Some(pts));
        packet.is_keyframe = rtp.header.marker;
        packet
    }
}

impl DemuxSession for LoopbackDemuxSession {
    fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        if let Some(packet) = self.probed.take() {
            return Ok(Some(packet));
        }
        match self.read_rtp() {
            Ok(rtp) => Ok(Some(self.to_media_packet(rtp))),
            Err(AdapterError::EndOfStream) => Ok(None),
            Err(e) => Err(Error::Adapter(e)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackMux {
    time_base: Rational,
    fail_header: bool,
    fail_after: Option<u64>,
}

impl Default for LoopbackMux {
    fn default() -> Self {
        Self {
            time_base: Rational::MPEG_TS,
            fail_header: false,
            fail_after: None,
        }
    }
}

impl LoopbackMux {
    /// Output time base every stream is forced to once the header is written
    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn fail_header(mut self) -> Self {
        self.fail_header = true;
        self
    }

    /// Reject every packet write after `packets` successful ones
    pub fn fail_after(mut self, packets: u64) -> Self {
        self.fail_after = Some(packets);
        self
    }
}

impl MuxEngine for LoopbackMux {
    fn format_name(&self) -> &str {
        "loopback"
    }

    fn open(&self, sink: ChunkSink) -> Result<Box<dyn MuxSession>> {
        Ok(Box::new(LoopbackMuxSession {
            config: self.clone(),
            sink,
            streams: Vec::new(),
            header_written: false,
            written: 0,
        }))
    }
}

struct LoopbackMuxSession {
    config: LoopbackMux,
    sink: ChunkSink,
    streams: Vec<Rational>,
    header_written: bool,
    written: u64,
}

impl MuxSession for LoopbackMuxSession {
    fn add_stream(&mut self, _params: &CodecParameters, time_base: Rational) -> Result<usize> {
        if self.header_written {
            return Err(Error::Engine("stream added after header".to_string()));
        }
        self.streams.push(time_base);
        Ok(self.streams.len() - 1)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.config.fail_header {
            return Err(Error::EngineFatal("header rejected".to_string()));
        }
        let mut header = BytesMut::with_capacity(3);
        header.put_u8(TAG_HEADER);
        header.put_u16(self.streams.len() as u16);
        self.sink.send(&header)?;

        for tb in &mut self.streams {
            *tb = self.config.time_base;
        }
        self.header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Result<Rational> {
        self.streams
            .get(index)
            .copied()
            .ok_or_else(|| Error::Engine(format!("no output stream {}", index)))
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        if !self.header_written {
            return Err(Error::EngineFatal("packet before header".to_string()));
        }
        if packet.stream_index >= self.streams.len() {
            return Err(Error::EngineFatal(format!(
                "packet for unknown stream {}",
                packet.stream_index
            )));
        }
        if let Some(limit) = self.config.fail_after {
            if self.written >= limit {
                return Err(Error::EngineFatal("write rejected".to_string()));
            }
        }

        let mut flags = 0;
        if packet.pts.is_some() {
            flags |= FLAG_PTS;
        }
        if packet.dts.is_some() {
            flags |= FLAG_DTS;
        }
        if packet.is_keyframe {
            flags |= FLAG_KEY;
        }

        let mut prefix = BytesMut::with_capacity(PACKET_PREFIX_LEN);
        prefix.put_u8(TAG_PACKET);
        prefix.put_u8(packet.stream_index as u8);
        prefix.put_u8(flags);
        prefix.put_i64(packet.pts.unwrap_or(0));
        prefix.put_i64(packet.dts.unwrap_or(0));
        prefix.put_u32(packet.data.len() as u32);

        self.sink.send(&prefix)?;
        self.sink.send(&packet.data)?;
        self.written += 1;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        let mut trailer = BytesMut::with_capacity(9);
        trailer.put_u8(TAG_TRAILER);
        trailer.put_u64(self.written);
        self.sink.send(&trailer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Header {
        streams: u16,
    },
    Packet {
        stream: u8,
        pts: Option<i64>,
        dts: Option<i64>,
        keyframe: bool,
        payload: Bytes,
    },
    Trailer {
        packets: u64,
    },
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> std::result::Result<&'a [u8], String> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| format!("truncated record at offset {}", pos))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Parse a complete loopback byte stream, rejecting any torn record.
pub fn parse_records(data: &[u8]) -> std::result::Result<Vec<Record>, String> {
    let mut records = Vec::new();
    let mut pos = 0;
    let mut streams: Option<u16> = None;

    while pos < data.len() {
        let offset = pos;
        let tag = take(data, &mut pos, 1)?[0];
        match tag {
            TAG_HEADER => {
                if streams.is_some() {
                    return Err(format!("second header at offset {}", offset));
                }
                let raw = take(data, &mut pos, 2)?;
                let count = u16::from_be_bytes([raw[0], raw[1]]);
                streams = Some(count);
                records.push(Record::Header { streams: count });
            }
            TAG_PACKET => {
                let count = streams.ok_or_else(|| format!("packet before header at {}", offset))?;
                let raw = take(data, &mut pos, PACKET_PREFIX_LEN - 1)?;
                let stream = raw[0];
                let flags = raw[1];
                if flags & !(FLAG_PTS | FLAG_DTS | FLAG_KEY) != 0 {
                    return Err(format!("bad flags {:#x} at offset {}", flags, offset));
                }
                if u16::from(stream) >= count {
                    return Err(format!("unknown stream {} at offset {}", stream, offset));
                }
                let pts = i64::from_be_bytes(raw[2..10].try_into().map_err(|_| "pts")?);
                let dts = i64::from_be_bytes(raw[10..18].try_into().map_err(|_| "dts")?);
                let len = u32::from_be_bytes(raw[18..22].try_into().map_err(|_| "len")?);
                let payload = Bytes::copy_from_slice(take(data, &mut pos, len as usize)?);
                records.push(Record::Packet {
                    stream,
                    pts: (flags & FLAG_PTS != 0).then_some(pts),
                    dts: (flags & FLAG_DTS != 0).then_some(dts),
                    keyframe: flags & FLAG_KEY != 0,
                    payload,
                });
            }
            TAG_TRAILER => {
                let raw = take(data, &mut pos, 8)?;
                let packets = u64::from_be_bytes(raw.try_into().map_err(|_| "trailer")?);
                records.push(Record::Trailer { packets });
                if pos != data.len() {
                    return Err(format!("data after trailer at offset {}", pos));
                }
            }
            other => return Err(format!("unknown tag {:#x} at offset {}", other, offset)),
        }
    }

    Ok(records)
}

/// Deterministic RTP packet generator.
///
/// Payloads start with the big-endian sequence number followed by filler
/// bytes derived from the SSRC.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    ssrc: u32,
    payload_type: u8,
    remaining: u64,
    sequence: u16,
    timestamp: u32,
    timestamp_step: u32,
    payload_len: usize,
    interval: Option<Duration>,
    silent: bool,
}

impl SyntheticSource {
    pub fn new(ssrc: u32, count: u64) -> Self {
        Self {
            ssrc,
            payload_type: 96,
            remaining: count,
            sequence: 0,
            timestamp: 0,
            timestamp_step: 3_000,
            payload_len: 160,
            interval: None,
            silent: false,
        }
    }

    /// A source that never produces a packet
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new(0, 0)
        }
    }

    pub fn with_timestamp_step(mut self, step: u32) -> Self {
        self.timestamp_step = step;
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len.max(2);
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn starting_at(mut self, sequence: u16, timestamp: u32) -> Self {
        self.sequence = sequence;
        self.timestamp = timestamp;
        self
    }

    /// Sleep between packets to simulate a paced network track
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    fn payload(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(self.payload_len);
        payload.put_u16(self.sequence);
        payload.resize(self.payload_len, self.ssrc as u8);
        payload.freeze()
    }
}

impl PacketSource for SyntheticSource {
    fn recv(&mut self, timeout: Option<Duration>) -> std::result::Result<Option<Packet>, SourceError> {
        if self.silent {
            return match timeout {
                Some(timeout) => {
                    thread::sleep(timeout);
                    Err(SourceError::Timeout)
                }
                None => Ok(None),
            };
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        if let Some(interval) = self.interval {
            thread::sleep(interval);
        }

        let packet = Packet {
            header: Header {
                version: 2,
                marker: self.remaining == 1,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: self.payload(),
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);
        self.remaining -= 1;
        Ok(Some(packet))
    }
}
