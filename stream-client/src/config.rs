//! Configuration for the streaming client and its managers.
//!
//! Configuration can be loaded from a TOML file; every field has a default,
//! so only the stream URL is normally required:
//!
//! ```toml
//! [transport]
//! url = "https://social.example/api/v1/streaming/user"
//!
//! [operations]
//! debounce_ms = 50
//! ```

use fedistream_core::ReconnectPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamConfig {
    /// Streaming transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Operation queue configuration.
    #[serde(default)]
    pub operations: OperationsConfig,
    /// Optimistic ledger configuration.
    #[serde(default)]
    pub optimistic: OptimisticConfig,
    /// State cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Streaming transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Streaming endpoint URL.
    #[serde(default)]
    pub url: String,
    /// Extra request headers (e.g. `Authorization`), sent verbatim.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Heartbeat ping interval in milliseconds (default: 30000, 0 = off).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Delay before the first reconnect in milliseconds (default: 1000).
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds (default: 30000).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Random jitter added to each reconnect delay in milliseconds (default: 0).
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
    /// Give up after this many failed reconnects (default: retry forever).
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Try the native event source before the byte-stream reader (default: true).
    #[serde(default = "default_prefer_native")]
    pub prefer_native: bool,
}

/// Operation queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationsConfig {
    /// Quiet period before a queued burst is drained, in milliseconds (default: 100).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum queued operations before the oldest is dropped (default: 1000).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Discard repeats of recently seen operations (default: true).
    #[serde(default = "default_deduplication_enabled")]
    pub deduplication_enabled: bool,
    /// How long an operation key is remembered, in milliseconds (default: 1000).
    #[serde(default = "default_deduplication_window_ms")]
    pub deduplication_window_ms: u64,
}

/// Optimistic ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimisticConfig {
    /// Hard deadline for a confirming operation in milliseconds (default: 10000).
    #[serde(default = "default_optimistic_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum concurrently pending updates (default: 100).
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// State cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached entities (default: unbounded).
    #[serde(default)]
    pub max_entries: Option<usize>,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_prefer_native() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_queue_size() -> usize {
    1_000
}

fn default_deduplication_enabled() -> bool {
    true
}

fn default_deduplication_window_ms() -> u64 {
    1_000
}

fn default_optimistic_timeout_ms() -> u64 {
    10_000
}

fn default_max_pending() -> usize {
    100
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: 0,
            max_reconnect_attempts: None,
            prefer_native: default_prefer_native(),
        }
    }
}

impl TransportConfig {
    /// Configuration for the given stream URL with defaults elsewhere.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the heartbeat interval (`Duration::ZERO` disables it).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay_ms = base.as_millis() as u64;
        self.reconnect_max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the retry cap.
    pub fn with_max_reconnect_attempts(mut self, max: Option<u32>) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Enable or disable the native event source.
    pub fn with_prefer_native(mut self, prefer_native: bool) -> Self {
        self.prefer_native = prefer_native;
        self
    }

    /// Heartbeat interval, or None when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Backoff policy derived from this configuration.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
        .with_max_attempts(self.max_reconnect_attempts)
        .with_jitter(Duration::from_millis(self.reconnect_jitter_ms))
    }

    /// Heartbeat endpoint: the stream URL with `/ping` appended.
    pub fn ping_url(&self) -> String {
        format!("{}/ping", self.url.trim_end_matches('/'))
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_queue_size: default_max_queue_size(),
            deduplication_enabled: default_deduplication_enabled(),
            deduplication_window_ms: default_deduplication_window_ms(),
        }
    }
}

impl OperationsConfig {
    /// Set the debounce interval.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Set the queue bound.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Configure deduplication (`None` disables it).
    pub fn with_deduplication(mut self, window: Option<Duration>) -> Self {
        self.deduplication_enabled = window.is_some();
        if let Some(window) = window {
            self.deduplication_window_ms = window.as_millis() as u64;
        }
        self
    }

    /// Debounce interval.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Deduplication window, or None when disabled.
    pub fn deduplication_window(&self) -> Option<Duration> {
        self.deduplication_enabled
            .then(|| Duration::from_millis(self.deduplication_window_ms))
    }
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_optimistic_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl OptimisticConfig {
    /// Set the confirmation deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pending cap.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Confirmation deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl StreamConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// values fail [`StreamConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file without validating it.
    ///
    /// Callers that patch values afterwards (command-line overrides, for
    /// instance) should call [`StreamConfig::validate`] themselves.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config)
    }

    /// Check values that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.url.trim().is_empty() {
            return Err(ConfigError::Invalid("transport.url must not be empty".into()));
        }
        if self.transport.reconnect_base_delay_ms > self.transport.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "transport.reconnect_base_delay_ms exceeds reconnect_max_delay_ms".into(),
            ));
        }
        if self.operations.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "operations.max_queue_size must be > 0".into(),
            ));
        }
        if self.optimistic.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "optimistic.max_pending must be > 0".into(),
            ));
        }
        if self.optimistic.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "optimistic.timeout_ms must be > 0".into(),
            ));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::Invalid("cache.max_entries must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
