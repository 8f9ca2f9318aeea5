//! Configuration for the stream relay
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::destination::SrtMode;

/// Main configuration for the stream relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// External encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Relay / supervision policy
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port accepting media connections
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Request path accepted for WebSocket upgrades
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// HTTP port for health and metrics
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ws_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_http_port() -> u16 {
    8081
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ws_port: default_ws_port(),
            ws_path: default_ws_path(),
            http_port: default_http_port(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Encoder executable (looked up on `PATH`)
    #[serde(default = "default_program")]
    pub program: String,

    /// Output width the input is scaled to
    #[serde(default = "default_width")]
    pub width: u32,

    /// Output height the scaled input is cropped to
    #[serde(default = "default_height")]
    pub height: u32,

    /// Video bitrate in kbit/s (also used as maxrate)
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate_kbps: u32,

    /// Audio bitrate in kbit/s
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,

    /// GOP length in frames
    #[serde(default = "default_gop")]
    pub gop: u32,

    /// SRT connection mode used when the destination does not name one
    #[serde(default)]
    pub default_srt_mode: SrtMode,

    /// SRT latency in milliseconds used when the destination does not name one
    #[serde(default = "default_srt_latency")]
    pub default_srt_latency_ms: u32,

    /// Stderr lines matching this pattern are forwarded to the client
    #[serde(default = "default_fatal_pattern")]
    pub fatal_pattern: String,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_video_bitrate() -> u32 {
    4000
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_gop() -> u32 {
    15
}

fn default_srt_latency() -> u32 {
    200
}

fn default_fatal_pattern() -> String {
    r"(?i)(connection refused|connection timed out|connection setup failure|error opening output|could not write header|invalid data found|no such file or directory)".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            width: default_width(),
            height: default_height(),
            video_bitrate_kbps: default_video_bitrate(),
            audio_bitrate_kbps: default_audio_bitrate(),
            gop: default_gop(),
            default_srt_mode: SrtMode::default(),
            default_srt_latency_ms: default_srt_latency(),
            fatal_pattern: default_fatal_pattern(),
        }
    }
}

/// Relay and process supervision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Consecutive unexpected encoder exits tolerated before a session fails
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before the first automatic restart, multiplied by the attempt number
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,

    /// How long the encoder gets to exit after its stdin is closed
    #[serde(default = "default_stdin_grace")]
    pub stdin_grace_ms: u64,

    /// How long the encoder gets to exit after SIGTERM before it is killed
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_ms: u64,

    /// Upper bound on media bytes buffered per session
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: usize,

    /// Maximum number of concurrent WebSocket connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff() -> u64 {
    500
}

fn default_stdin_grace() -> u64 {
    2000
}

fn default_terminate_grace() -> u64 {
    3000
}

fn default_max_queue_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_connections() -> usize {
    100
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff(),
            stdin_grace_ms: default_stdin_grace(),
            terminate_grace_ms: default_terminate_grace(),
            max_queue_bytes: default_max_queue_bytes(),
            max_connections: default_max_connections(),
        }
    }
}

impl RelayConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stdin_grace(&self) -> Duration {
        Duration::from_millis(self.stdin_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Server
        if let Ok(host) = std::env::var("RELAY_HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse("RELAY_WS_PORT") {
            config.server.ws_port = port;
        }
        if let Ok(path) = std::env::var("RELAY_WS_PATH") {
            config.server.ws_path = path;
        }
        if let Some(port) = env_parse("RELAY_HTTP_PORT") {
            config.server.http_port = port;
        }

        // Encoder
        if let Ok(program) = std::env::var("RELAY_ENCODER") {
            config.encoder.program = program;
        }
        if let Some(latency) = env_parse("RELAY_SRT_LATENCY_MS") {
            config.encoder.default_srt_latency_ms = latency;
        }

        // Relay
        if let Some(max) = env_parse("RELAY_MAX_RESTARTS") {
            config.relay.max_restarts = max;
        }
        if let Some(max) = env_parse("RELAY_MAX_CONNECTIONS") {
            config.relay.max_connections = max;
        }
        if let Some(max) = env_parse("RELAY_MAX_QUEUE_BYTES") {
            config.relay.max_queue_bytes = max;
        }

        // Logging
        if let Ok(filter) = std::env::var("RELAY_LOG") {
            config.logging.filter = filter;
        }
        if let Ok(json) = std::env::var("RELAY_LOG_JSON") {
            config.logging.json = json == "1" || json.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.ws_port == 0 || self.server.http_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "ws_path must start with '/': {}",
                self.server.ws_path
            )));
        }
        if self.encoder.program.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder program is empty".to_string()));
        }
        regex::Regex::new(&self.encoder.fatal_pattern)
            .map_err(|e| ConfigError::Invalid(format!("fatal_pattern: {}", e)))?;
        if self.relay.max_queue_bytes == 0 {
            return Err(ConfigError::Invalid("max_queue_bytes must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
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
