//! Configuration management for the rdio relay

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Call ingestion pipeline
    pub ingest: IngestConfig,

    /// Live session settings
    pub live: LiveConfig,

    /// Downstream relay settings
    pub relay: RelayConfig,

    /// Audio conversion settings
    pub audio: AudioConfig,

    /// Options pushed to live clients
    pub options: ClientOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Capacity of the admission queue
    #[serde(default = "default_ingest_queue_size")]
    pub queue_size: usize,

    /// Create unknown systems, talkgroups and units on sight
    #[serde(default)]
    pub auto_populate: bool,

    /// Skip the duplicate call check
    #[serde(default)]
    pub disable_duplicate_detection: bool,

    /// Duplicate detection window in milliseconds
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,

    /// Maximum accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Live session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Per-session outbound queue capacity
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,

    /// Heartbeat interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Write deadline in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    /// Capacity of the register / unregister queues
    #[serde(default = "default_register_queue_size")]
    pub register_queue_size: usize,

    /// PIN attempts allowed before a session is locked out
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
}

/// Downstream relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP client timeout in seconds
    #[serde(default = "default_relay_timeout")]
    pub timeout: u64,
}

/// How uploaded audio is transcoded before persistence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    /// Store audio as uploaded
    #[default]
    Disabled,
    /// Transcode to AAC
    Enabled,
    /// Transcode to AAC with loudness normalization
    Normalized,
}

/// Audio conversion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Conversion mode
    #[serde(default)]
    pub conversion: ConversionMode,

    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

/// Client-facing options sent with every configuration push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Branding label shown by clients
    #[serde(default)]
    pub branding: String,

    /// Contact email shown by clients
    #[serde(default)]
    pub email: String,

    /// Display dimmer delay in milliseconds
    #[serde(default = "default_dimmer_delay")]
    pub dimmer_delay: u32,

    /// Keypad beep style
    #[serde(default = "default_keypad_beeps")]
    pub keypad_beeps: String,

    /// Playback continues into live feed
    #[serde(default)]
    pub playback_goes_live: bool,

    /// Broadcast listener counts to sessions
    #[serde(default)]
    pub show_listeners_count: bool,

    /// Sort talkgroups by label instead of order
    #[serde(default)]
    pub sort_talkgroups: bool,

    /// Toggle live feed by tag
    #[serde(default)]
    pub tags_toggle: bool,

    /// Use a 12 hour clock
    #[serde(default)]
    pub time12h_format: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json or text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://localhost/rdio".to_string())
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_idle_timeout() -> u64 {
    600
}

const fn default_ingest_queue_size() -> usize {
    8192
}

const fn default_duplicate_window_ms() -> u64 {
    500
}

const fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

const fn default_send_queue_size() -> usize {
    8
}

const fn default_ping_interval() -> u64 {
    5
}

const fn default_write_timeout() -> u64 {
    30
}

const fn default_register_queue_size() -> usize {
    64
}

const fn default_max_auth_attempts() -> u32 {
    5
}

const fn default_relay_timeout() -> u64 {
    30
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

const fn default_dimmer_delay() -> u32 {
    5000
}

fn default_keypad_beeps() -> String {
    "uniden".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_size: default_ingest_queue_size(),
            auto_populate: false,
            disable_duplicate_detection: false,
            duplicate_window_ms: default_duplicate_window_ms(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            send_queue_size: default_send_queue_size(),
            ping_interval: default_ping_interval(),
            write_timeout: default_write_timeout(),
            register_queue_size: default_register_queue_size(),
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout: default_relay_timeout(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            conversion: ConversionMode::default(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            branding: String::new(),
            email: String::new(),
            dimmer_delay: default_dimmer_delay(),
            keypad_beeps: default_keypad_beeps(),
            playback_goes_live: false,
            show_listeners_count: false,
            sort_talkgroups: false,
            tags_toggle: false,
            time12h_format: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from `config.*` in the working directory and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file (or `config.*` when `None`)
    /// overlaid with `RDIO_` prefixed environment variables
    ///
    /// Nested keys use a double underscore, e.g. `RDIO_SERVER__PORT=8080`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed.
    pub fn load_from(path: Option<&Path>) -> crate::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("RDIO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })
    }
}
