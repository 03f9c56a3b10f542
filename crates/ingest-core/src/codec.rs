//! Negotiated codecs, engine-neutral stream parameters and payload formats

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::time_base::Rational;

/// Codec negotiated for one remote track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    /// MIME type, e.g. `audio/opus` or `video/H264`
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    /// Raw `a=fmtp` parameters, possibly empty
    pub sdp_fmtp_line: String,
    pub payload_type: u8,
}

impl TrackCodec {
    pub fn new(mime_type: impl Into<String>, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            mime_type: mime_type.into(),
            clock_rate,
            channels: 0,
            sdp_fmtp_line: String::new(),
            payload_type,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.sdp_fmtp_line = fmtp.into();
        self
    }

    pub fn opus() -> Self {
        Self::new("audio/opus", 48_000, 111)
            .with_channels(2)
            .with_fmtp("minptime=10;useinbandfec=1")
    }

    pub fn h264() -> Self {
        Self::new("video/H264", 90_000, 102).with_fmtp(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        )
    }

    pub fn vp8() -> Self {
        Self::new("video/VP8", 90_000, 96)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Opus,
    Pcmu,
    Pcma,
    G722,
    Vp8,
    Vp9,
    H264,
    H265,
    Av1,
    /// Anything an engine reports that has no neutral mapping
    Unknown,
}

impl CodecId {
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            CodecId::Opus | CodecId::Pcmu | CodecId::Pcma | CodecId::G722 => {
                Some(MediaKind::Audio)
            }
            CodecId::Vp8 | CodecId::Vp9 | CodecId::H264 | CodecId::H265 | CodecId::Av1 => {
                Some(MediaKind::Video)
            }
            CodecId::Unknown => None,
        }
    }

    /// RTP encoding name as it appears in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            CodecId::Opus => "opus",
            CodecId::Pcmu => "PCMU",
            CodecId::Pcma => "PCMA",
            CodecId::G722 => "G722",
            CodecId::Vp8 => "VP8",
            CodecId::Vp9 => "VP9",
            CodecId::H264 => "H264",
            CodecId::H265 => "H265",
            CodecId::Av1 => "AV1",
            CodecId::Unknown => "unknown",
        }
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let codec = match mime_type.to_ascii_lowercase().as_str() {
            "audio/opus" => CodecId::Opus,
            "audio/pcmu" => CodecId::Pcmu,
            "audio/pcma" => CodecId::Pcma,
            "audio/g722" => CodecId::G722,
            "video/vp8" => CodecId::Vp8,
            "video/vp9" => CodecId::Vp9,
            "video/h264" => CodecId::H264,
            "video/h265" => CodecId::H265,
            "video/av1" => CodecId::Av1,
            _ => return None,
        };
        Some(codec)
    }
}

/// Per-stream parameters handed from a demux session to a mux session.
///
/// `native` lets an engine carry its own full parameter record (extradata
/// layouts, profile flags) between its demux and mux side; other engines
/// fall back to the neutral fields.
#[derive(Clone)]
pub struct CodecParameters {
    pub kind: MediaKind,
    pub codec: CodecId,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u64,
    pub extradata: Vec<u8>,
    pub native: Option<Arc<dyn Any + Send + Sync>>,
}

impl CodecParameters {
    pub fn audio(codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec,
            sample_rate,
            channels,
            width: 0,
            height: 0,
            bit_rate: 0,
            extradata: Vec::new(),
            native: None,
        }
    }

    pub fn video(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            codec,
            sample_rate: 0,
            channels: 0,
            width,
            height,
            bit_rate: 0,
            extradata: Vec::new(),
            native: None,
        }
    }

    /// Downcast the engine-private parameter record
    pub fn native<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.native.as_deref().and_then(|n| n.downcast_ref::<T>())
    }
}

impl fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecParameters")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bit_rate", &self.bit_rate)
            .field("extradata_len", &self.extradata.len())
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Probed description of the single stream inside one demux session
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub params: CodecParameters,
    pub time_base: Rational,
}

/// Payload-format description a demuxing engine needs to interpret the RTP
/// packets of one track, rendered as a single-media SDP document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFormat {
    pub kind: MediaKind,
    pub codec: CodecId,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: Option<String>,
}

impl PayloadFormat {
    /// Port advertised in the `m=` line; never bound with custom I/O.
    const MEDIA_PORT: u16 = 5004;

    pub fn from_codec(codec: &TrackCodec) -> Result<Self> {
        let id = CodecId::from_mime_type(&codec.mime_type)
            .ok_or_else(|| Error::UnsupportedPayload(codec.mime_type.clone()))?;
        let kind = id
            .kind()
            .ok_or_else(|| Error::UnsupportedPayload(codec.mime_type.clone()))?;
        if codec.clock_rate == 0 {
            return Err(Error::UnsupportedPayload(format!(
                "{} with zero clock rate",
                codec.mime_type
            )));
        }

        let fmtp = codec.sdp_fmtp_line.trim();
        Ok(Self {
            kind,
            codec: id,
            payload_type: codec.payload_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            fmtp: (!fmtp.is_empty()).then(|| fmtp.to_string()),
        })
    }

    pub fn time_base(&self) -> Rational {
        Rational::from_clock_rate(self.clock_rate).unwrap_or(Rational::MPEG_TS)
    }

    pub fn to_sdp(&self) -> String {
        let pt = self.payload_type;
        let mut sdp = String::with_capacity(256);
        sdp.push_str("v=0\r\n");
        sdp.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
        sdp.push_str("s=whip-mpegts\r\n");
        sdp.push_str("c=IN IP4 127.0.0.1\r\n");
        sdp.push_str("t=0 0\r\n");
        sdp.push_str(&format!(
            "m={} {} RTP/AVP {}\r\n",
            self.kind,
            Self::MEDIA_PORT,
            pt
        ));
        if self.kind == MediaKind::Audio && self.channels > 1 {
            sdp.push_str(&format!(
                "a=rtpmap:{} {}/{}/{}\r\n",
                pt,
                self.codec.encoding_name(),
                self.clock_rate,
                self.channels
            ));
        } else {
            sdp.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                pt,
                self.codec.encoding_name(),
                self.clock_rate
            ));
        }
        if let Some(fmtp) = &self.fmtp {
            sdp.push_str(&format!("a=fmtp:{} {}\r\n", pt, fmtp));
        }
        sdp
    }
}
