//! Index settings.
//!
//! Settings are a flat `key -> value` map seeded from an immutable defaults
//! table. Each key belongs to one of three partitions:
//!
//! | Kind | Pushed to the backend | Changeable after creation |
//! |------|-----------------------|---------------------------|
//! | [`SettingKind::Dynamic`] | yes | yes |
//! | [`SettingKind::Local`] | never | yes |
//! | [`SettingKind::Static`] | at creation only | no |
//!
//! Keys that are not listed in the defaults table are treated as static.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{IndexError, IndexResult};

/// Upper bound on pagination depth; also the scroll batch size of filtered bulk operations.
pub const RESULT_WINDOW: &str = "max_result_window";
/// Maximum number of terms in a single terms query.
pub const MAX_TERMS_COUNT: &str = "max_terms_count";
/// Translog fsync interval for async durability.
pub const TRANSLOG_SYNC_INTERVAL: &str = "translog.sync_interval";
/// Primary shard count of newly created indices.
pub const NUMBER_OF_SHARDS: &str = "number_of_shards";
/// Maximum number of in-flight bulk requests during a commit.
pub const COMMIT_CONCURRENCY_LEVEL: &str = "commit_concurrency_level";
/// Number of actions after which the bulk stream sends a request.
pub const BULK_ACTIONS_SIZE: &str = "bulk_actions_size";
/// Request size in megabytes after which the bulk stream sends a request.
pub const BULK_ACTIONS_SIZE_IN_MB: &str = "bulk_actions_size_in_mb";
/// Staged document count above which a commit is logged.
pub const COMMIT_WATERMARK_LOW: &str = "commit_watermark_low";
/// Staged document count above which a commit is logged as a warning.
pub const COMMIT_WATERMARK_HIGH: &str = "commit_watermark_high";
/// Overall readiness deadline after index creation, in milliseconds.
pub const CLUSTER_HEALTH_TIMEOUT: &str = "cluster_health_timeout";
/// Backend socket timeout in milliseconds; each readiness poll waits half of it.
pub const SOCKET_TIMEOUT: &str = "socket_timeout";

/// Keys the backend accepts on a live index.
const DYNAMIC_SETTINGS: &[&str] = &[RESULT_WINDOW];

/// Client-side keys that are never sent to the backend.
const LOCAL_SETTINGS: &[&str] = &[COMMIT_WATERMARK_LOW, COMMIT_WATERMARK_HIGH];

enum DefaultValue {
    Number(u64),
    Text(&'static str),
    CommitConcurrency,
}

const DEFAULTS: &[(&str, DefaultValue)] = &[
    (RESULT_WINDOW, DefaultValue::Number(10_000)),
    (MAX_TERMS_COUNT, DefaultValue::Number(65_536)),
    (TRANSLOG_SYNC_INTERVAL, DefaultValue::Text("5s")),
    (NUMBER_OF_SHARDS, DefaultValue::Number(1)),
    (COMMIT_CONCURRENCY_LEVEL, DefaultValue::CommitConcurrency),
    (BULK_ACTIONS_SIZE, DefaultValue::Number(10_000)),
    (BULK_ACTIONS_SIZE_IN_MB, DefaultValue::Number(9)),
    (COMMIT_WATERMARK_LOW, DefaultValue::Number(10_000)),
    (COMMIT_WATERMARK_HIGH, DefaultValue::Number(25_000)),
    (CLUSTER_HEALTH_TIMEOUT, DefaultValue::Number(300_000)),
    (SOCKET_TIMEOUT, DefaultValue::Number(60_000)),
];

impl DefaultValue {
    fn value(&self) -> Value {
        match self {
            DefaultValue::Number(n) => json!(n),
            DefaultValue::Text(s) => json!(s),
            DefaultValue::CommitConcurrency => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                json!((cpus / 4).max(1))
            }
        }
    }
}

/// The partition a setting key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKind {
    /// Backend-supported and safe to push to a live index.
    Dynamic,
    /// Client-only configuration.
    Local,
    /// Fixed at index creation.
    Static,
}

impl SettingKind {
    /// Classifies a key.
    pub fn of(key: &str) -> Self {
        if DYNAMIC_SETTINGS.contains(&key) {
            SettingKind::Dynamic
        } else if LOCAL_SETTINGS.contains(&key) {
            SettingKind::Local
        } else {
            SettingKind::Static
        }
    }

    /// Whether keys of this kind can be changed after creation.
    pub fn is_updateable(self) -> bool {
        !matches!(self, SettingKind::Static)
    }
}

/// The settings of one index client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Settings {
    /// The defaults table.
    pub fn defaults() -> Self {
        Self {
            values: DEFAULTS
                .iter()
                .map(|(key, default)| (key.to_string(), default.value()))
                .collect(),
        }
    }

    /// Defaults with the given keys overridden.
    pub fn with_overrides<K, I>(overrides: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut settings = Self::defaults();
        for (key, value) in overrides {
            settings.values.insert(key.into(), value);
        }
        settings
    }

    /// Raw value of a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Reads a numeric setting, accepting both numbers and numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        as_u64(self.values.get(key)?)
    }

    /// Every setting, defaults included.
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Maximum `from + size` of a search page.
    pub fn result_window(&self) -> u64 {
        self.get_u64(RESULT_WINDOW).unwrap_or(10_000)
    }

    /// In-flight bulk requests per stream, at least one.
    pub fn commit_concurrency_level(&self) -> usize {
        self.get_u64(COMMIT_CONCURRENCY_LEVEL).unwrap_or(1).max(1) as usize
    }

    /// Action count threshold of the bulk stream.
    pub fn bulk_actions(&self) -> usize {
        self.get_u64(BULK_ACTIONS_SIZE).unwrap_or(10_000).max(1) as usize
    }

    /// Request size threshold of the bulk stream, in bytes.
    pub fn bulk_size_bytes(&self) -> usize {
        (self.get_u64(BULK_ACTIONS_SIZE_IN_MB).unwrap_or(9).max(1) * 1024 * 1024) as usize
    }

    /// `(low, high)` commit size watermarks.
    pub fn commit_watermarks(&self) -> (u64, u64) {
        (
            self.get_u64(COMMIT_WATERMARK_LOW).unwrap_or(10_000),
            self.get_u64(COMMIT_WATERMARK_HIGH).unwrap_or(25_000),
        )
    }

    /// Deadline of the readiness wait.
    pub fn cluster_health_timeout(&self) -> Duration {
        Duration::from_millis(self.get_u64(CLUSTER_HEALTH_TIMEOUT).unwrap_or(300_000))
    }

    /// Backend socket timeout.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.get_u64(SOCKET_TIMEOUT).unwrap_or(60_000))
    }

    /// Index-level settings sent along with the static ones at creation time.
    pub fn creation_settings(&self) -> BTreeMap<String, Value> {
        [RESULT_WINDOW, MAX_TERMS_COUNT, TRANSLOG_SYNC_INTERVAL]
            .into_iter()
            .filter_map(|key| self.values.get(key).map(|v| (key.to_string(), v.clone())))
            .collect()
    }

    /// Rejects the update if any key is static. Nothing is mutated.
    pub fn validate_update(updates: &BTreeMap<String, Value>) -> IndexResult<()> {
        let rejected: Vec<String> = updates
            .keys()
            .filter(|key| !SettingKind::of(key).is_updateable())
            .cloned()
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(IndexError::SettingsRejected { keys: rejected })
        }
    }

    /// Whether applying `updates` would change any value.
    ///
    /// A numeric string and the number it spells are the same value.
    pub fn differs(&self, updates: &BTreeMap<String, Value>) -> bool {
        updates
            .iter()
            .any(|(key, value)| match self.values.get(key) {
                Some(current) => !same_value(current, value),
                None => true,
            })
    }

    /// The subset of `updates` that the backend should receive.
    pub fn dynamic_subset(updates: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        updates
            .iter()
            .filter(|(key, _)| SettingKind::of(key) == SettingKind::Dynamic)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn merge(&mut self, updates: &BTreeMap<String, Value>) {
        for (key, value) in updates {
            self.values.insert(key.clone(), value.clone());
        }
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn same_value(current: &Value, update: &Value) -> bool {
    match (as_u64(current), as_u64(update)) {
        (Some(a), Some(b)) => a == b,
        _ => current == update,
    }
}
