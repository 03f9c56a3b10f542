//! Pipeline tuning knobs

use std::time::Duration;

/// Largest serialized RTP packet a demux read accepts (one Ethernet MTU).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1500;

/// How long `await_all` waits for every negotiated track.
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a track may stay silent before its first packet.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Output chunks in flight between the muxer and the reader.
pub const DEFAULT_RELAY_CAPACITY: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub read_buffer_size: usize,
    pub barrier_timeout: Duration,
    pub probe_timeout: Duration,
    pub relay_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
        }
    }
}
