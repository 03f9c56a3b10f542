//! Custom AVIO contexts
//!
//! Each context owns a boxed state object passed to libav as `opaque`. The
//! box is reclaimed only after the context itself is freed, so callbacks
//! never see a dangling pointer.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::slice;

use ffmpeg_next::ffi;
use tracing::trace;
use whip_mpegts_core::{AdapterError, ByteStreamAdapter, ChunkSink, Error};

use crate::error::{averror_for, FfmpegError};

/// Write buffer for the mux side: seven 188-byte transport packets
pub const MUX_BUFFER_SIZE: usize = 188 * 7;

pub(crate) struct ReadState {
    pub adapter: ByteStreamAdapter,
    /// Last adapter failure, so `av_read_frame` errors can be told apart
    pub last_error: Option<AdapterError>,
}

pub(crate) struct WriteState {
    pub sink: ChunkSink,
    pub last_error: Option<Error>,
}

/// An `AVIOContext` plus the state its callbacks run against
pub(crate) struct CustomIo<S> {
    ctx: *mut ffi::AVIOContext,
    state: *mut S,
}

impl<S> CustomIo<S> {
    pub fn as_ptr(&self) -> *mut ffi::AVIOContext {
        self.ctx
    }

    /// # Safety
    ///
    /// Only call while no libav call can run a callback concurrently.
    pub unsafe fn state(&mut self) -> &mut S {
        &mut *self.state
    }
}

impl CustomIo<ReadState> {
    /// Read context for the RTP demuxer.
    ///
    /// The write callback must exist even though RTCP is discarded: the RTP
    /// demuxer reads through `ffio_read_partial`, which only calls the read
    /// callback directly when the context is writable.
    pub fn reader(adapter: ByteStreamAdapter) -> Result<Self, FfmpegError> {
        let buffer_size = adapter.buffer_size();
        let state = Box::new(ReadState {
            adapter,
            last_error: None,
        });
        unsafe { Self::alloc(state, buffer_size, Some(read_rtp), Some(discard_rtcp)) }
    }
}

impl CustomIo<WriteState> {
    pub fn writer(sink: ChunkSink) -> Result<Self, FfmpegError> {
        let state = Box::new(WriteState {
            sink,
            last_error: None,
        });
        unsafe { Self::alloc(state, MUX_BUFFER_SIZE, None, Some(write_chunk)) }
    }
}

type ReadFn = unsafe extern "C" fn(*mut c_void, *mut u8, c_int) -> c_int;
type WriteFn = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

impl<S> CustomIo<S> {
    unsafe fn alloc(
        state: Box<S>,
        buffer_size: usize,
        read: Option<ReadFn>,
        write: Option<WriteFn>,
    ) -> Result<Self, FfmpegError> {
        let buffer = ffi::av_malloc(buffer_size) as *mut u8;
        if buffer.is_null() {
            return Err(FfmpegError::new("av_malloc", ffi::AVERROR(libc::ENOMEM)));
        }

        let state = Box::into_raw(state);
        let ctx = ffi::avio_alloc_context(
            buffer,
            buffer_size as c_int,
            1,
            state as *mut c_void,
            read,
            write,
            None,
        );
        if ctx.is_null() {
            ffi::av_free(buffer as *mut c_void);
            drop(Box::from_raw(state));
            return Err(FfmpegError::new(
                "avio_alloc_context",
                ffi::AVERROR(libc::ENOMEM),
            ));
        }

        Ok(Self { ctx, state })
    }
}

impl<S> Drop for CustomIo<S> {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                // libav may have swapped the buffer; free whatever it holds now
                ffi::av_freep(&mut (*self.ctx).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.ctx);
            }
            if !self.state.is_null() {
                drop(Box::from_raw(self.state));
                self.state = ptr::null_mut();
            }
        }
    }
}

// Owned exclusively by one demux or mux session
unsafe impl<S: Send> Send for CustomIo<S> {}

unsafe extern "C" fn read_rtp(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let state = &mut *(opaque as *mut ReadState);
    if buf_size <= 0 {
        return ffi::AVERROR(libc::EINVAL);
    }
    let out = slice::from_raw_parts_mut(buf, buf_size as usize);
    match state.adapter.read(out) {
        Ok(n) => n as c_int,
        Err(e) => {
            trace!(track = state.adapter.track(), error = %e, "AVIO read failed");
            let code = averror_for(&e);
            state.last_error = Some(e);
            code
        }
    }
}

// https://trac.ffmpeg.org/ticket/9670
unsafe extern "C" fn discard_rtcp(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    let state = &mut *(opaque as *mut ReadState);
    if buf_size <= 0 {
        return 0;
    }
    let data = slice::from_raw_parts(buf, buf_size as usize);
    state.adapter.write(data) as c_int
}

unsafe extern "C" fn write_chunk(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    let state = &mut *(opaque as *mut WriteState);
    if buf_size <= 0 {
        return 0;
    }
    let chunk = slice::from_raw_parts(buf, buf_size as usize);
    match state.sink.send(chunk) {
        Ok(()) => buf_size,
        Err(e) => {
            state.last_error = Some(e);
            ffi::AVERROR(libc::EPIPE)
        }
    }
}
