//! Container-level packets

use bytes::Bytes;

use crate::time_base::Rational;

/// One demuxed access unit on its way into the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// Track index while demuxing, output stream index once rewritten
    pub stream_index: usize,
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// Time base `pts`, `dts` and `duration` are expressed in
    pub time_base: Rational,
    pub is_keyframe: bool,
    /// Byte position in the input; `None` when unknown or not applicable
    pub position: Option<i64>,
}

impl MediaPacket {
    pub fn new(stream_index: usize, data: impl Into<Bytes>, time_base: Rational) -> Self {
        Self {
            stream_index,
            data: data.into(),
            pts: None,
            dts: None,
            duration: 0,
            time_base,
            is_keyframe: false,
            position: None,
        }
    }

    pub fn with_timestamps(mut self, pts: Option<i64>, dts: Option<i64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    /// Convert every timestamp into `to`, leaving unknown ones unknown.
    pub fn rescale(&mut self, to: Rational) {
        let from = self.time_base;
        self.pts = from.rescale_opt(self.pts, to);
        self.dts = from.rescale_opt(self.dts, to);
        self.duration = from.rescale(self.duration, to);
        self.time_base = to;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
