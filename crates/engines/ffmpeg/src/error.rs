//! libav error codes

use std::ffi::{c_char, c_int};

use ffmpeg_next::ffi;
use whip_mpegts_core::{AdapterError, Error};

/// A failed libav call
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed: {message} ({code})")]
pub struct FfmpegError {
    pub operation: &'static str,
    pub code: c_int,
    pub message: String,
}

impl FfmpegError {
    pub fn new(operation: &'static str, code: c_int) -> Self {
        Self {
            operation,
            code,
            message: ffmpeg_error_string(code),
        }
    }

    /// Failure during setup or demuxing
    pub fn into_engine(self) -> Error {
        Error::Engine(self.to_string())
    }

    /// Failure on the shared mux write path
    pub fn into_fatal(self) -> Error {
        Error::EngineFatal(self.to_string())
    }
}

/// Human-readable text for a libav error code
pub fn ffmpeg_error_string(errnum: c_int) -> String {
    let mut buf = [0u8; ffi::AV_ERROR_MAX_STRING_SIZE as usize];
    let ret = unsafe { ffi::av_strerror(errnum, buf.as_mut_ptr() as *mut c_char, buf.len()) };
    if ret < 0 {
        return format!("unknown error {}", errnum);
    }
    String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .to_string()
}

/// AVIO return code for an adapter failure
pub(crate) fn averror_for(err: &AdapterError) -> c_int {
    match err {
        AdapterError::EndOfStream => ffi::AVERROR_EOF,
        AdapterError::Io(_) => ffi::AVERROR(libc::EIO),
        AdapterError::Malformed(_) => ffi::AVERROR(libc::EINVAL),
        AdapterError::Overflow { .. } => ffi::AVERROR(libc::ENOMEM),
        AdapterError::Timeout => ffi::AVERROR(libc::ETIMEDOUT),
    }
}
