//! Codec parameter conversion between libav and the pipeline's neutral types

use std::ffi::c_int;
use std::ptr;
use std::sync::Arc;

use ffmpeg_next::ffi;
use whip_mpegts_core::{CodecId, CodecParameters, MediaKind, Rational};

use crate::error::FfmpegError;

/// Owned copy of an `AVCodecParameters` record.
///
/// Carried in [`CodecParameters::native`] so the mux side can copy the full
/// probed record, extradata included.
pub struct NativeCodecParameters {
    ptr: *mut ffi::AVCodecParameters,
}

// The record is never mutated after the copy and is only read through
// `avcodec_parameters_copy`, which takes a const source.
unsafe impl Send for NativeCodecParameters {}
unsafe impl Sync for NativeCodecParameters {}

impl NativeCodecParameters {
    /// # Safety
    ///
    /// `src` must point to a valid `AVCodecParameters`.
    pub(crate) unsafe fn copy_from(src: *const ffi::AVCodecParameters) -> Result<Self, FfmpegError> {
        let mut ptr = ffi::avcodec_parameters_alloc();
        if ptr.is_null() {
            return Err(FfmpegError::new(
                "avcodec_parameters_alloc",
                ffi::AVERROR(libc::ENOMEM),
            ));
        }
        let ret = ffi::avcodec_parameters_copy(ptr, src);
        if ret < 0 {
            ffi::avcodec_parameters_free(&mut ptr);
            return Err(FfmpegError::new("avcodec_parameters_copy", ret));
        }
        Ok(Self { ptr })
    }

    pub(crate) fn as_ptr(&self) -> *const ffi::AVCodecParameters {
        self.ptr
    }
}

impl Drop for NativeCodecParameters {
    fn drop(&mut self) {
        unsafe { ffi::avcodec_parameters_free(&mut self.ptr) };
    }
}

impl std::fmt::Debug for NativeCodecParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCodecParameters").finish_non_exhaustive()
    }
}

pub fn to_av_codec_id(codec: CodecId) -> ffi::AVCodecID {
    use ffi::AVCodecID::*;

    match codec {
        CodecId::Opus => AV_CODEC_ID_OPUS,
        CodecId::Pcmu => AV_CODEC_ID_PCM_MULAW,
        CodecId::Pcma => AV_CODEC_ID_PCM_ALAW,
        CodecId::G722 => AV_CODEC_ID_ADPCM_G722,
        CodecId::Vp8 => AV_CODEC_ID_VP8,
        CodecId::Vp9 => AV_CODEC_ID_VP9,
        CodecId::H264 => AV_CODEC_ID_H264,
        CodecId::H265 => AV_CODEC_ID_HEVC,
        CodecId::Av1 => AV_CODEC_ID_AV1,
        CodecId::Unknown => AV_CODEC_ID_NONE,
    }
}

pub fn from_av_codec_id(id: ffi::AVCodecID) -> CodecId {
    use ffi::AVCodecID::*;

    match id {
        AV_CODEC_ID_OPUS => CodecId::Opus,
        AV_CODEC_ID_PCM_MULAW => CodecId::Pcmu,
        AV_CODEC_ID_PCM_ALAW => CodecId::Pcma,
        AV_CODEC_ID_ADPCM_G722 => CodecId::G722,
        AV_CODEC_ID_VP8 => CodecId::Vp8,
        AV_CODEC_ID_VP9 => CodecId::Vp9,
        AV_CODEC_ID_H264 => CodecId::H264,
        AV_CODEC_ID_HEVC => CodecId::H265,
        AV_CODEC_ID_AV1 => CodecId::Av1,
        _ => CodecId::Unknown,
    }
}

pub(crate) fn from_av_rational(r: ffi::AVRational) -> Rational {
    Rational::new(r.num, r.den)
}

pub(crate) fn to_av_rational(r: Rational) -> ffi::AVRational {
    ffi::AVRational {
        num: r.num,
        den: r.den,
    }
}

/// Read the neutral fields of a probed stream and keep a native copy.
///
/// # Safety
///
/// `par` must point to a valid `AVCodecParameters`.
pub(crate) unsafe fn read_codec_parameters(
    par: *const ffi::AVCodecParameters,
    fallback_kind: MediaKind,
) -> Result<CodecParameters, FfmpegError> {
    let kind = match (*par).codec_type {
        ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => MediaKind::Audio,
        ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => MediaKind::Video,
        _ => fallback_kind,
    };
    let codec = from_av_codec_id((*par).codec_id);

    let mut params = match kind {
        MediaKind::Audio => CodecParameters::audio(
            codec,
            (*par).sample_rate.max(0) as u32,
            (*par).ch_layout.nb_channels.max(0) as u16,
        ),
        MediaKind::Video => {
            CodecParameters::video(codec, (*par).width.max(0) as u32, (*par).height.max(0) as u32)
        }
    };
    params.bit_rate = (*par).bit_rate.max(0) as u64;
    if !(*par).extradata.is_null() && (*par).extradata_size > 0 {
        params.extradata =
            std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize).to_vec();
    }
    params.native = Some(Arc::new(NativeCodecParameters::copy_from(par)?));
    Ok(params)
}

/// Fill an output stream's parameters, preferring the native record.
///
/// # Safety
///
/// `dst` must point to the `codecpar` of a freshly created output stream.
pub(crate) unsafe fn write_codec_parameters(
    dst: *mut ffi::AVCodecParameters,
    params: &CodecParameters,
) -> Result<(), FfmpegError> {
    if let Some(native) = params.native::<NativeCodecParameters>() {
        let ret = ffi::avcodec_parameters_copy(dst, native.as_ptr());
        if ret < 0 {
            return Err(FfmpegError::new("avcodec_parameters_copy", ret));
        }
        // The input's codec tag means nothing to another container
        (*dst).codec_tag = 0;
        return Ok(());
    }

    (*dst).codec_id = to_av_codec_id(params.codec);
    (*dst).bit_rate = params.bit_rate as i64;
    match params.kind {
        MediaKind::Audio => {
            (*dst).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*dst).sample_rate = params.sample_rate as c_int;
            ffi::av_channel_layout_default(
                &mut (*dst).ch_layout,
                c_int::from(params.channels.max(1)),
            );
        }
        MediaKind::Video => {
            (*dst).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*dst).width = params.width as c_int;
            (*dst).height = params.height as c_int;
        }
    }

    if !params.extradata.is_empty() {
        let alloc_size = params.extradata.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let buf = ffi::av_mallocz(alloc_size) as *mut u8;
        if buf.is_null() {
            return Err(FfmpegError::new("av_mallocz", ffi::AVERROR(libc::ENOMEM)));
        }
        ptr::copy_nonoverlapping(params.extradata.as_ptr(), buf, params.extradata.len());
        (*dst).extradata = buf;
        (*dst).extradata_size = params.extradata.len() as c_int;
    }
    Ok(())
}
