//! Server configuration loading from file and environment variables.

use callflow_stream::StreamSettings;
use callflow_transcript::BufferConfig;
use callflow_translate::{ChainSettings, ProviderConfig};
use callflow_voice::VoiceSettings;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Inbound webhook authentication.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Outbound telephony command API.
    #[serde(default)]
    pub telephony: TelephonyConfig,

    /// Per-call pipeline sizing and timing.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Translation provider chain.
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Speech synthesis for voice-to-voice calls.
    #[serde(default)]
    pub voice: VoiceSettings,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callflow_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Webhook signature settings.
///
/// With no secret every inbound event is rejected.
#[derive(Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: Option<String>,

    /// Maximum age (and clock skew) of a signed timestamp, in seconds.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
}

/// Telephony provider command API.
#[derive(Clone, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default = "default_telephony_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Timeout for every outbound command, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Where the provider should post events for legs the engine dials.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Caller id used when a start-call request does not name one.
    #[serde(default)]
    pub from_number: Option<String>,
}

/// Per-call pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Provider events a call worker may have queued before ingress defers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Provider sequence number of a call's first transcript segment.
    #[serde(default = "default_first_sequence")]
    pub first_sequence: u64,

    #[serde(default = "default_reorder_window_ms")]
    pub reorder_window_ms: u64,

    /// How long a terminated call still accepts late segments before its
    /// buffer is flushed.
    #[serde(default = "default_flush_grace_ms")]
    pub flush_grace_ms: u64,

    /// Upper bound on finishing translations after a call ends.
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,

    #[serde(default = "default_replay_depth")]
    pub replay_depth: usize,

    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// How long a closed stream answers "closed" before it is forgotten.
    #[serde(default = "default_stream_linger_secs")]
    pub stream_linger_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Translation chain settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Consecutive failures before a provider is skipped.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Providers in fallback order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "callflow.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tolerance_secs() -> u64 {
    300
}

fn default_telephony_url() -> String {
    "http://127.0.0.1:8089".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_first_sequence() -> u64 {
    1
}

fn default_reorder_window_ms() -> u64 {
    1_500
}

fn default_flush_grace_ms() -> u64 {
    2_000
}

fn default_drain_deadline_ms() -> u64 {
    5_000
}

fn default_replay_depth() -> usize {
    256
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_stream_linger_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_provider_timeout_ms() -> u64 {
    3_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
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
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_secs: default_tolerance_secs(),
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: default_telephony_url(),
            api_key: None,
            request_timeout_ms: default_request_timeout_ms(),
            webhook_url: None,
            from_number: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            first_sequence: default_first_sequence(),
            reorder_window_ms: default_reorder_window_ms(),
            flush_grace_ms: default_flush_grace_ms(),
            drain_deadline_ms: default_drain_deadline_ms(),
            replay_depth: default_replay_depth(),
            broadcast_capacity: default_broadcast_capacity(),
            stream_linger_secs: default_stream_linger_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            providers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl std::fmt::Debug for TelephonyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelephonyConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("webhook_url", &self.webhook_url)
            .field("from_number", &self.from_number)
            .finish()
    }
}

impl PipelineConfig {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            first_sequence: self.first_sequence,
            reorder_window: Duration::from_millis(self.reorder_window_ms),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            replay_depth: self.replay_depth,
            broadcast_capacity: self.broadcast_capacity,
            linger: Duration::from_secs(self.stream_linger_secs),
        }
    }
}

impl TranslationConfig {
    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            provider_timeout: Duration::from_millis(self.provider_timeout_ms),
            breaker_threshold: self.breaker_threshold,
            breaker_cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLFLOW_HOST` overrides `server.host`
/// - `CALLFLOW_PORT` overrides `server.port`
/// - `CALLFLOW_DB_PATH` overrides `database.path`
/// - `CALLFLOW_LOG_LEVEL` overrides `logging.level`
/// - `CALLFLOW_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `CALLFLOW_WEBHOOK_SECRET` overrides `webhook.secret`
/// - `CALLFLOW_TELEPHONY_API_KEY` overrides `telephony.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("CALLFLOW_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("CALLFLOW_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("CALLFLOW_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("CALLFLOW_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("CALLFLOW_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(secret) = std::env::var("CALLFLOW_WEBHOOK_SECRET") {
        config.webhook.secret = Some(secret);
    }
    if let Ok(key) = std::env::var("CALLFLOW_TELEPHONY_API_KEY") {
        config.telephony.api_key = Some(key);
    }

    Ok(config)
}
