//! Content script configuration
//!
//! Defaults ship embedded as TOML. A page or the extension's loader may set
//! `window.__IRIS_CONFIG__` before the script runs; any field present there
//! wins over the embedded value. The result is validated once and handed to
//! the engine, which never sees it change.

use iris_types::{ConfigError, EngineConfig};
use serde::Deserialize;
use wasm_bindgen::JsValue;

/// Embedded defaults
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Global the page may define to override defaults
pub const OVERRIDE_GLOBAL: &str = "__IRIS_CONFIG__";

/// Fields a page may override. Absent fields keep the embedded value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub endpoint_path: Option<String>,
    pub db_name: Option<String>,
    pub initial_delay_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub min_image_size: Option<u32>,
    pub failure_retry_after_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub normalize_urls: Option<bool>,
    pub debug_logging: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut EngineConfig) {
        if let Some(v) = self.base_url {
            config.base_url = v;
        }
        if let Some(v) = self.endpoint_path {
            config.endpoint_path = v;
        }
        if let Some(v) = self.db_name {
            config.db_name = v;
        }
        if let Some(v) = self.initial_delay_ms {
            config.initial_delay_ms = v;
        }
        if let Some(v) = self.debounce_ms {
            config.debounce_ms = v;
        }
        if let Some(v) = self.min_image_size {
            config.min_image_size = v;
        }
        if let Some(v) = self.failure_retry_after_ms {
            config.failure_retry_after_ms = Some(v);
        }
        if let Some(v) = self.request_timeout_ms {
            config.request_timeout_ms = v;
        }
        if let Some(v) = self.normalize_urls {
            config.normalize_urls = v;
        }
        if let Some(v) = self.debug_logging {
            config.debug_logging = v;
        }
    }
}

/// Embedded defaults merged with page overrides, validated.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::from_toml_str(DEFAULT_CONFIG)?;
    if let Some(overrides) = page_overrides() {
        overrides.apply(&mut config);
        config.validate()?;
    }
    Ok(config)
}

fn page_overrides() -> Option<ConfigOverrides> {
    let window = web_sys::window()?;
    let value = js_sys::Reflect::get(&window, &JsValue::from_str(OVERRIDE_GLOBAL)).ok()?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    match serde_wasm_bindgen::from_value(value) {
        Ok(overrides) => Some(overrides),
        Err(err) => {
            // Logging is not up yet; this lands in the console directly
            web_sys::console::warn_1(&JsValue::from_str(&format!(
                "[IRIS] Ignoring malformed {OVERRIDE_GLOBAL}: {err}"
            )));
            None
        }
    }
}
