//! Container muxing through libavformat with a push-style write callback

use std::ffi::{c_int, CString};
use std::ptr;

use ffmpeg_next::ffi;
use tracing::debug;
use whip_mpegts_core::engine::{MuxEngine, MuxSession};
use whip_mpegts_core::{ChunkSink, CodecParameters, Error, MediaPacket, Rational, Result};

use crate::error::FfmpegError;
use crate::io::{CustomIo, WriteState};
use crate::params::{from_av_rational, to_av_rational, write_codec_parameters};

/// Mux engine for any libavformat output format, MPEG-TS by default
#[derive(Debug, Clone)]
pub struct FfmpegMux {
    format: String,
}

impl Default for FfmpegMux {
    fn default() -> Self {
        Self::mpegts()
    }
}

impl FfmpegMux {
    pub fn mpegts() -> Self {
        Self::new("mpegts")
    }

    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }
}

impl MuxEngine for FfmpegMux {
    fn format_name(&self) -> &str {
        &self.format
    }

    fn open(&self, sink: ChunkSink) -> Result<Box<dyn MuxSession>> {
        crate::init()?;
        let session = unsafe { FfmpegMuxSession::open(&self.format, sink)? };
        Ok(Box::new(session))
    }
}

struct FfmpegMuxSession {
    ctx: *mut ffi::AVFormatContext,
    io: Option<CustomIo<WriteState>>,
    packet: *mut ffi::AVPacket,
    header_written: bool,
}

// Every call is serialized by the muxer's write lock
unsafe impl Send for FfmpegMuxSession {}

impl FfmpegMuxSession {
    unsafe fn open(format: &str, sink: ChunkSink) -> Result<Self> {
        let name = CString::new(format)
            .map_err(|e| Error::Engine(format!("format name: {}", e)))?;

        let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        let ret =
            ffi::avformat_alloc_output_context2(&mut ctx, ptr::null(), name.as_ptr(), ptr::null());
        if ret < 0 || ctx.is_null() {
            return Err(FfmpegError::new("avformat_alloc_output_context2", ret).into_engine());
        }

        let mut session = Self {
            ctx,
            io: None,
            packet: ptr::null_mut(),
            header_written: false,
        };

        let io = CustomIo::writer(sink).map_err(FfmpegError::into_engine)?;
        (*ctx).pb = io.as_ptr();
        (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
        // Hand bytes to the sink as soon as a packet is muxed
        (*ctx).flush_packets = 1;
        session.io = Some(io);

        session.packet = ffi::av_packet_alloc();
        if session.packet.is_null() {
            return Err(
                FfmpegError::new("av_packet_alloc", ffi::AVERROR(libc::ENOMEM)).into_engine(),
            );
        }

        Ok(session)
    }

    /// A write failure, preferring the sink's own error over libav's code
    fn write_error(&mut self, operation: &'static str, code: c_int) -> Error {
        let sink_error = self
            .io
            .as_mut()
            .and_then(|io| unsafe { io.state() }.last_error.take());
        sink_error.unwrap_or_else(|| FfmpegError::new(operation, code).into_fatal())
    }

    fn stream_count(&self) -> usize {
        unsafe { (*self.ctx).nb_streams as usize }
    }
}

impl MuxSession for FfmpegMuxSession {
    fn add_stream(&mut self, params: &CodecParameters, time_base: Rational) -> Result<usize> {
        if self.header_written {
            return Err(Error::Engine("stream added after header".to_string()));
        }
        unsafe {
            let st = ffi::avformat_new_stream(self.ctx, ptr::null());
            if st.is_null() {
                return Err(FfmpegError::new("avformat_new_stream", ffi::AVERROR(libc::ENOMEM))
                    .into_engine());
            }
            write_codec_parameters((*st).codecpar, params).map_err(FfmpegError::into_engine)?;
            (*st).time_base = to_av_rational(time_base);

            debug!(
                stream = (*st).index,
                codec = ?params.codec,
                time_base = %time_base,
                "Output stream declared"
            );
            Ok((*st).index as usize)
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let ret = unsafe { ffi::avformat_write_header(self.ctx, ptr::null_mut()) };
        if ret < 0 {
            return Err(self.write_error("avformat_write_header", ret));
        }
        self.header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Result<Rational> {
        if index >= self.stream_count() {
            return Err(Error::Engine(format!("no output stream {}", index)));
        }
        unsafe {
            let st = *(*self.ctx).streams.add(index);
            Ok(from_av_rational((*st).time_base))
        }
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        if !self.header_written {
            return Err(Error::EngineFatal("packet written before header".to_string()));
        }
        if packet.stream_index >= self.stream_count() {
            return Err(Error::EngineFatal(format!(
                "packet for unknown stream {}",
                packet.stream_index
            )));
        }

        let ret = unsafe {
            let pkt = self.packet;
            let ret = ffi::av_new_packet(pkt, packet.data.len() as c_int);
            if ret < 0 {
                return Err(FfmpegError::new("av_new_packet", ret).into_fatal());
            }
            if !packet.data.is_empty() {
                ptr::copy_nonoverlapping(packet.data.as_ptr(), (*pkt).data, packet.data.len());
            }

            (*pkt).stream_index = packet.stream_index as c_int;
            (*pkt).pts = packet.pts.unwrap_or(ffi::AV_NOPTS_VALUE);
            (*pkt).dts = packet.dts.unwrap_or(ffi::AV_NOPTS_VALUE);
            (*pkt).duration = packet.duration;
            (*pkt).pos = packet.position.unwrap_or(-1);
            if packet.is_keyframe {
                (*pkt).flags |= ffi::AV_PKT_FLAG_KEY as c_int;
            }

            // Takes ownership of the payload reference and resets `pkt`
            let ret = ffi::av_interleaved_write_frame(self.ctx, pkt);
            ffi::av_packet_unref(pkt);
            ret
        };

        if ret < 0 {
            return Err(self.write_error("av_interleaved_write_frame", ret));
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(Error::EngineFatal("trailer written before header".to_string()));
        }
        let ret = unsafe { ffi::av_write_trailer(self.ctx) };
        if ret < 0 {
            return Err(self.write_error("av_write_trailer", ret));
        }
        unsafe { ffi::avio_flush((*self.ctx).pb) };

        // avio_flush reports failures only through the callback state
        match self
            .io
            .as_mut()
            .and_then(|io| unsafe { io.state() }.last_error.take())
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for FfmpegMuxSession {
    fn drop(&mut self) {
        unsafe {
            if !self.packet.is_null() {
                ffi::av_packet_free(&mut self.packet);
            }
            if !self.ctx.is_null() {
                ffi::avformat_free_context(self.ctx);
                self.ctx = ptr::null_mut();
            }
        }
        // Frees the AVIO context and releases the sink
        self.io.take();
    }
}
