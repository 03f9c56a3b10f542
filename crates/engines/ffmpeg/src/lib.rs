//! FFmpeg container engine for the WHIP ingest pipeline
//!
//! - [`FfmpegDemux`]: one libavformat `sdp` demuxer per track, fed RTP
//!   packets through a custom AVIO read callback.
//! - [`FfmpegMux`]: a libavformat muxer (`mpegts` by default) whose AVIO
//!   write callback forwards every chunk into the pipeline's
//!   [`ChunkSink`](whip_mpegts_core::ChunkSink).
//!
//! Uses raw `ffmpeg_next::ffi` calls; the safe wrapper has no custom I/O.

pub mod demux;
pub mod error;
mod io;
pub mod mux;
pub mod params;

use std::ffi::c_int;
use std::str::FromStr;
use std::sync::OnceLock;

use ffmpeg_next::ffi;
use whip_mpegts_core::{Error, Result};

pub use demux::FfmpegDemux;
pub use error::{ffmpeg_error_string, FfmpegError};
pub use io::MUX_BUFFER_SIZE;
pub use mux::FfmpegMux;
pub use params::NativeCodecParameters;

static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize libav once per process.
///
/// Sets the libav log level to [`LogLevel::Error`] unless
/// [`set_log_level`] was called before.
pub fn init() -> Result<()> {
    INIT.get_or_init(|| {
        ffmpeg_next::init().map_err(|e| e.to_string())?;
        if !LOG_LEVEL_SET.get().copied().unwrap_or(false) {
            set_log_level(LogLevel::Error);
        }
        Ok(())
    })
    .clone()
    .map_err(|e| Error::Engine(format!("ffmpeg init failed: {}", e)))
}

static LOG_LEVEL_SET: OnceLock<bool> = OnceLock::new();

/// libav log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Quiet,
    #[default]
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    fn as_av(self) -> c_int {
        match self {
            LogLevel::Quiet => ffi::AV_LOG_QUIET as c_int,
            LogLevel::Error => ffi::AV_LOG_ERROR as c_int,
            LogLevel::Warning => ffi::AV_LOG_WARNING as c_int,
            LogLevel::Info => ffi::AV_LOG_INFO as c_int,
            LogLevel::Verbose => ffi::AV_LOG_VERBOSE as c_int,
            LogLevel::Debug => ffi::AV_LOG_DEBUG as c_int,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quiet" => Ok(LogLevel::Quiet),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "verbose" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown ffmpeg log level: {}", other)),
        }
    }
}

pub fn set_log_level(level: LogLevel) {
    let _ = LOG_LEVEL_SET.set(true);
    unsafe { ffi::av_log_set_level(level.as_av()) };
}
