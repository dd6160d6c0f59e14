//! Index client configuration.
//!
//! [`IndexConfig`] names the store, optionally prefixes every physical index
//! and carries the settings overrides applied on top of the defaults table.
//!
//! # Example
//!
//! ```
//! use helios_index::config::IndexConfig;
//!
//! let config: IndexConfig = serde_json::from_str(r#"{
//!     "name": "SNOMEDCT",
//!     "prefix": "test",
//!     "settings": { "max_result_window": 500 },
//!     "retry": { "max_attempts": 3, "min_backoff": "50ms", "max_backoff": "200ms" }
//! }"#).unwrap();
//!
//! assert_eq!(config.physical_index("concept"), "test.snomedct-concept");
//! assert_eq!(config.settings().result_window(), 500);
//! assert_eq!(config.retry.max_attempts, 3);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retry::RetryPolicy;
use crate::settings::Settings;

/// Configuration of one named store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Store name; physical index names are derived from it.
    pub name: String,

    /// Optional prefix shared by every index of the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Overrides applied on top of the settings defaults.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,

    /// Version conflict retry policy for filtered bulk operations.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// How long a commit waits for in-flight bulk requests on close.
    #[serde(with = "humantime_serde", default = "default_bulk_close_timeout")]
    pub bulk_close_timeout: Duration,
}

fn default_bulk_close_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new("index")
    }
}

impl IndexConfig {
    /// Creates a configuration with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            settings: BTreeMap::new(),
            retry: RetryPolicy::default(),
            bulk_close_timeout: default_bulk_close_timeout(),
        }
    }

    /// Sets the prefix shared by every physical index name.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Overrides one entry of the settings defaults table.
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Replaces the conflict retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The lower-cased store name.
    pub fn store_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Builds the settings value from the defaults table and overrides.
    pub fn settings(&self) -> Settings {
        Settings::with_overrides(self.settings.clone())
    }

    /// Common prefix of every physical index of this store: `{prefix.}{name}`.
    pub fn index_base(&self) -> String {
        match self.prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{}.{}", prefix, self.store_name()).to_lowercase(),
            None => self.store_name(),
        }
    }

    /// Physical index holding documents whose index type is `index_type`.
    pub fn physical_index(&self, index_type: &str) -> String {
        format!("{}-{}", self.index_base(), index_type.to_lowercase())
    }
}

/// Serde adapter for human readable durations (`"5s"`, `"1m 30s"`).
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
