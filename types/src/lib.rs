//! Shared configuration types for the IRIS overlay engine.
//!
//! Everything the engine needs to know at start-up lives in [`EngineConfig`].
//! The config is loaded once by the host integration and never mutated while
//! the engine runs.

pub mod formatting;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default backend origin (the detection API's local development address)
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
/// Default detection route on the backend
pub const DEFAULT_ENDPOINT_PATH: &str = "get-detections";
/// Images smaller than this in either rendered dimension never get an overlay
pub const DEFAULT_MIN_IMAGE_SIZE: u32 = 256;
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

// ─────────────────────────────────────────────────────────────────────────────
// Engine Config
// ─────────────────────────────────────────────────────────────────────────────

/// Static configuration handed to the engine at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend origin, e.g. `https://api.example.com`
    pub base_url: String,
    /// Route of the detection endpoint relative to `base_url`
    pub endpoint_path: String,
    /// Tenant database name sent as `db_name`
    pub db_name: String,
    /// Delay before the first full-document scan
    pub initial_delay_ms: u64,
    /// Batch window for coalescing mutation bursts
    pub debounce_ms: u64,
    /// Pixel floor applied to both rendered dimensions
    pub min_image_size: u32,
    /// Retry a failed lookup after this many milliseconds.
    /// `None` keeps failures cached for the lifetime of the page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_retry_after_ms: Option<u64>,
    /// Abandon a detection request after this many milliseconds and treat
    /// it as a network failure. `0` disables the bound.
    pub request_timeout_ms: u64,
    /// Strip query string and fragment from image URLs before caching
    pub normalize_urls: bool,
    /// Log per-element decisions at debug level
    pub debug_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            db_name: "default".to_string(),
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            min_image_size: DEFAULT_MIN_IMAGE_SIZE,
            failure_retry_after_ms: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            normalize_urls: true,
            debug_logging: false,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values the engine cannot work without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidValue {
            field: "base_url".to_string(),
            message: e.to_string(),
        })?;
        if self.db_name.trim().is_empty() {
            return Err(ConfigError::MissingField("db_name".to_string()));
        }
        if self.endpoint_path.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingField("endpoint_path".to_string()));
        }
        if self.min_image_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "min_image_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn failure_cache_policy(&self) -> FailureCachePolicy {
        match self.failure_retry_after_ms {
            Some(ms) => FailureCachePolicy::RetryAfter(Duration::from_millis(ms)),
            None => FailureCachePolicy::Forever,
        }
    }
}

/// How long a failed lookup stays cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureCachePolicy {
    /// Never retry within the page lifetime
    #[default]
    Forever,
    /// Treat a cached failure older than this as a miss
    RetryAfter(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
