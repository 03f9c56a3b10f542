//! RTP demuxing through libavformat's `sdp` input format
//!
//! Each track gets a one-media SDP description written to a temp file. The
//! demuxer parses it with `sdp_flags=custom_io`, which stops it from opening
//! sockets; RTP packets are then read through our AVIO context instead.

use std::ffi::{c_int, CString};
use std::io::Write;
use std::path::Path;
use std::ptr;
use std::slice;
use std::time::Duration;

use ffmpeg_next::ffi;
use tracing::{debug, warn};
use whip_mpegts_core::engine::{DemuxEngine, DemuxSession};
use whip_mpegts_core::{
    AdapterError, ByteStreamAdapter, CodecParameters, Error, MediaKind, MediaPacket,
    PayloadFormat, Result, StreamInfo,
};

use crate::error::FfmpegError;
use crate::io::{CustomIo, ReadState};
use crate::params::{from_av_rational, read_codec_parameters};

/// Demux engine backed by libavformat
#[derive(Debug, Clone)]
pub struct FfmpegDemux {
    analyze_duration: Duration,
    probe_size: i64,
}

impl Default for FfmpegDemux {
    fn default() -> Self {
        Self {
            analyze_duration: Duration::from_secs(1),
            probe_size: 64 * 1024,
        }
    }
}

impl FfmpegDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on media time `avformat_find_stream_info` examines
    pub fn with_analyze_duration(mut self, duration: Duration) -> Self {
        self.analyze_duration = duration;
        self
    }

    pub fn with_probe_size(mut self, bytes: i64) -> Self {
        self.probe_size = bytes.max(32);
        self
    }
}

impl DemuxEngine for FfmpegDemux {
    fn open(
        &self,
        format: &PayloadFormat,
        input: ByteStreamAdapter,
    ) -> Result<Box<dyn DemuxSession>> {
        crate::init()?;

        let mut sdp = tempfile::Builder::new()
            .prefix("whip-track-")
            .suffix(".sdp")
            .tempfile()?;
        sdp.write_all(format.to_sdp().as_bytes())?;
        sdp.flush()?;

        let session = unsafe { FfmpegDemuxSession::open(self, format, input, sdp.path())? };
        Ok(Box::new(session))
    }
}

struct FfmpegDemuxSession {
    ctx: *mut ffi::AVFormatContext,
    io: Option<CustomIo<ReadState>>,
    packet: *mut ffi::AVPacket,
    stream: StreamInfo,
    track: usize,
}

// Owned by exactly one pull loop; libav state is never shared
unsafe impl Send for FfmpegDemuxSession {}

impl FfmpegDemuxSession {
    unsafe fn open(
        engine: &FfmpegDemux,
        format: &PayloadFormat,
        input: ByteStreamAdapter,
        sdp_path: &Path,
    ) -> Result<Self> {
        let track = input.track();
        let path = CString::new(sdp_path.to_string_lossy().as_bytes())
            .map_err(|e| Error::Engine(format!("sdp path: {}", e)))?;

        let sdp_format = ffi::av_find_input_format(c"sdp".as_ptr());
        if sdp_format.is_null() {
            return Err(Error::Engine(
                "libavformat was built without the sdp demuxer".to_string(),
            ));
        }

        let mut ctx = ffi::avformat_alloc_context();
        if ctx.is_null() {
            return Err(FfmpegError::new("avformat_alloc_context", ffi::AVERROR(libc::ENOMEM))
                .into_engine());
        }
        (*ctx).max_analyze_duration = engine.analyze_duration.as_micros() as i64;
        (*ctx).probesize = engine.probe_size;

        let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
        ffi::av_dict_set(&mut opts, c"sdp_flags".as_ptr(), c"custom_io".as_ptr(), 0);
        ffi::av_dict_set_int(&mut opts, c"reorder_queue_size".as_ptr(), 0, 0);

        let ret = ffi::avformat_open_input(&mut ctx, path.as_ptr(), sdp_format, &mut opts);
        ffi::av_dict_free(&mut opts);
        if ret < 0 {
            // libav frees the context on failure
            return Err(FfmpegError::new("avformat_open_input", ret).into_engine());
        }

        // The description has been read; packets come from the adapter now
        ffi::avio_closep(&mut (*ctx).pb);
        let io = match CustomIo::reader(input) {
            Ok(io) => io,
            Err(e) => {
                ffi::avformat_close_input(&mut ctx);
                return Err(e.into_engine());
            }
        };
        (*ctx).pb = io.as_ptr();
        (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

        let mut session = Self {
            ctx,
            io: Some(io),
            packet: ptr::null_mut(),
            stream: StreamInfo {
                params: fallback_params(format),
                time_base: format.time_base(),
            },
            track,
        };

        let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
        let delivered = session
            .io
            .as_mut()
            .map(|io| io.state().adapter.stats().packets)
            .unwrap_or(0);
        if ret < 0 || delivered == 0 {
            return Err(session.probe_error(ret));
        }

        let streams = (*ctx).nb_streams;
        if streams != 1 {
            return Err(Error::Engine(format!(
                "sdp demuxer reported {} streams, expected 1",
                streams
            )));
        }

        let st = *(*ctx).streams;
        let params =
            read_codec_parameters((*st).codecpar, format.kind).map_err(FfmpegError::into_engine)?;
        let time_base = from_av_rational((*st).time_base);
        session.stream = StreamInfo {
            params,
            time_base: if time_base.is_valid() {
                time_base
            } else {
                warn!(track, time_base = %time_base, "Invalid probed time base, using clock rate");
                format.time_base()
            },
        };

        session.packet = ffi::av_packet_alloc();
        if session.packet.is_null() {
            return Err(
                FfmpegError::new("av_packet_alloc", ffi::AVERROR(libc::ENOMEM)).into_engine(),
            );
        }

        debug!(
            track,
            codec = ?session.stream.params.codec,
            time_base = %session.stream.time_base,
            "sdp demuxer probed stream"
        );
        Ok(session)
    }

    unsafe fn probe_error(&mut self, ret: c_int) -> Error {
        let last = self.io.as_mut().and_then(|io| io.state().last_error.take());
        match last {
            Some(AdapterError::Timeout) => {
                Error::Engine("probe failed: no packet before probe timeout".to_string())
            }
            Some(AdapterError::EndOfStream) => {
                Error::Engine("probe failed: stream ended before first packet".to_string())
            }
            Some(e) => Error::Engine(format!("probe failed: {}", e)),
            None if ret < 0 => FfmpegError::new("avformat_find_stream_info", ret).into_engine(),
            None => Error::Engine("probe failed: no packet delivered".to_string()),
        }
    }

    unsafe fn take_packet(&mut self) -> MediaPacket {
        let pkt = self.packet;
        let data = if (*pkt).data.is_null() || (*pkt).size <= 0 {
            Vec::new()
        } else {
            slice::from_raw_parts((*pkt).data, (*pkt).size as usize).to_vec()
        };
        let timestamp = |ts: i64| (ts != ffi::AV_NOPTS_VALUE).then_some(ts);

        let mut packet = MediaPacket::new(self.track, data, self.stream.time_base)
            .with_timestamps(timestamp((*pkt).pts), timestamp((*pkt).dts));
        packet.duration = (*pkt).duration.max(0);
        packet.is_keyframe = (*pkt).flags & ffi::AV_PKT_FLAG_KEY as c_int != 0;
        packet.position = ((*pkt).pos >= 0).then_some((*pkt).pos);

        ffi::av_packet_unref(pkt);
        packet
    }
}

impl DemuxSession for FfmpegDemuxSession {
    fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        unsafe {
            let ret = ffi::av_read_frame(self.ctx, self.packet);
            let last = self.io.as_mut().and_then(|io| io.state().last_error.take());

            if ret >= 0 {
                return Ok(Some(self.take_packet()));
            }
            match last {
                Some(AdapterError::EndOfStream) => Ok(None),
                Some(e) => Err(Error::Adapter(e)),
                None if ret == ffi::AVERROR_EOF => Ok(None),
                None => Err(FfmpegError::new("av_read_frame", ret).into_engine()),
            }
        }
    }
}

impl Drop for FfmpegDemuxSession {
    fn drop(&mut self) {
        unsafe {
            if !self.packet.is_null() {
                ffi::av_packet_free(&mut self.packet);
            }
            if !self.ctx.is_null() {
                // AVFMT_FLAG_CUSTOM_IO: the AVIO context stays ours
                ffi::avformat_close_input(&mut self.ctx);
            }
        }
        self.io.take();
    }
}

fn fallback_params(format: &PayloadFormat) -> CodecParameters {
    match format.kind {
        MediaKind::Audio => {
            CodecParameters::audio(format.codec, format.clock_rate, format.channels.max(1))
        }
        MediaKind::Video => CodecParameters::video(format.codec, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whip_mpegts_core::engine::loopback::SyntheticSource;
    use whip_mpegts_core::{PipelineConfig, TrackCodec};

    #[test]
    fn test_silent_track_fails_probe() {
        let mut config = PipelineConfig::default();
        config.probe_timeout = Duration::from_millis(20);
        let adapter = ByteStreamAdapter::new(Box::new(SyntheticSource::silent()), 0, &config);
        let format = PayloadFormat::from_codec(&TrackCodec::opus()).unwrap();

        let result = FfmpegDemux::default().open(&format, adapter);
        match result {
            Err(Error::Engine(message)) => assert!(message.contains("probe"), "{}", message),
            other => panic!("expected probe failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_empty_track_fails_probe() {
        let adapter = ByteStreamAdapter::new(
            Box::new(SyntheticSource::new(1, 0)),
            0,
            &PipelineConfig::default(),
        );
        let format = PayloadFormat::from_codec(&TrackCodec::vp8()).unwrap();
        assert!(matches!(
            FfmpegDemux::default().open(&format, adapter),
            Err(Error::Engine(_))
        ));
    }
}
