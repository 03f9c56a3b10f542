//! Configuration for the WHIP ingest gateway
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use whip_mpegts_core::PipelineConfig as CorePipelineConfig;

/// Main configuration for the WHIP ingest gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub webrtc: WebRtcConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port for the WHIP endpoint
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Prefix for the `Location` header, e.g. `https://ingest.example.com`
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            public_base_url: None,
        }
    }
}

/// A TURN relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,

    /// Upper bound on ICE candidate gathering before the answer is returned
    #[serde(default = "default_ice_gathering_timeout")]
    pub ice_gathering_timeout_secs: u64,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_ice_gathering_timeout() -> u64 {
    10
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            ice_gathering_timeout_secs: default_ice_gathering_timeout(),
        }
    }
}

impl WebRtcConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gathering_timeout_secs)
    }
}

/// Muxing pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long to wait for every negotiated track
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout_secs: u64,

    /// How long a track may stay silent before its first packet
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Largest RTP packet a demuxer read accepts
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Output chunks buffered between the muxer and the stream consumer
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,

    /// RTP packets buffered per track between the peer and its demuxer
    #[serde(default = "default_track_queue_capacity")]
    pub track_queue_capacity: usize,
}

fn default_barrier_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_read_buffer_size() -> usize {
    1500
}

fn default_relay_capacity() -> usize {
    1
}

fn default_track_queue_capacity() -> usize {
    512
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            barrier_timeout_secs: default_barrier_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            read_buffer_size: default_read_buffer_size(),
            relay_capacity: default_relay_capacity(),
            track_queue_capacity: default_track_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Knobs handed to the core muxer
    pub fn to_core(&self) -> CorePipelineConfig {
        CorePipelineConfig {
            read_buffer_size: self.read_buffer_size,
            barrier_timeout: Duration::from_secs(self.barrier_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            relay_capacity: self.relay_capacity,
        }
    }
}

/// Session and resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

/// Where finished MPEG-TS streams go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Copy each stream to standard output
    #[default]
    Stdout,
    /// Write `<directory>/<session-id>.ts` per session
    Directory,
}

impl std::str::FromStr for OutputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(OutputMode::Stdout),
            "directory" | "dir" => Ok(OutputMode::Directory),
            other => Err(ConfigError::Invalid(format!("unknown output mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub mode: OutputMode,

    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./recordings")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::default(),
            directory: default_output_directory(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply `WHIP_*` overrides read through `lookup`
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server
        if let Some(port) = lookup("WHIP_HTTP_PORT") {
            self.server.http_port = parse_var("WHIP_HTTP_PORT", &port)?;
        }
        if let Some(host) = lookup("WHIP_HOST") {
            self.server.host = host;
        }
        if let Some(url) = lookup("WHIP_PUBLIC_BASE_URL") {
            self.server.public_base_url = Some(url).filter(|u| !u.is_empty());
        }

        // WebRTC
        if let Some(servers) = lookup("WHIP_STUN_SERVERS") {
            self.webrtc.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // Pipeline
        if let Some(secs) = lookup("WHIP_BARRIER_TIMEOUT") {
            self.pipeline.barrier_timeout_secs = parse_var("WHIP_BARRIER_TIMEOUT", &secs)?;
        }
        if let Some(secs) = lookup("WHIP_PROBE_TIMEOUT") {
            self.pipeline.probe_timeout_secs = parse_var("WHIP_PROBE_TIMEOUT", &secs)?;
        }

        // Limits
        if let Some(max) = lookup("WHIP_MAX_SESSIONS") {
            self.limits.max_sessions = parse_var("WHIP_MAX_SESSIONS", &max)?;
        }

        // Output
        if let Some(mode) = lookup("WHIP_OUTPUT_MODE") {
            self.output.mode = mode.parse()?;
        }
        if let Some(dir) = lookup("WHIP_OUTPUT_DIR") {
            self.output.directory = PathBuf::from(dir);
        }

        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.pipeline.barrier_timeout_secs == 0, "pipeline.barrier_timeout_secs"),
            (self.pipeline.probe_timeout_secs == 0, "pipeline.probe_timeout_secs"),
            (self.pipeline.read_buffer_size == 0, "pipeline.read_buffer_size"),
            (self.pipeline.relay_capacity == 0, "pipeline.relay_capacity"),
            (self.pipeline.track_queue_capacity == 0, "pipeline.track_queue_capacity"),
            (self.limits.max_sessions == 0, "limits.max_sessions"),
            (self.webrtc.ice_gathering_timeout_secs == 0, "webrtc.ice_gathering_timeout_secs"),
        ];
        if let Some((_, name)) = checks.iter().find(|(zero, _)| *zero) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}={:?} is not a valid value", key, value)))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
