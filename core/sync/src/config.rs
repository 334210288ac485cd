//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Default key under which the pending queue is persisted.
pub const DEFAULT_QUEUE_KEY: &str = "pending_actions";
/// Default key under which dead-lettered actions are persisted.
pub const DEFAULT_DEAD_LETTER_KEY: &str = "dead_letters";

/// Configuration for the sync engine and its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for one action, including all in-call retries.
    #[serde(rename = "action_timeout_secs", with = "duration_secs")]
    pub action_timeout: Duration,
    /// In-call retry policy for transport failures.
    pub retry: RetryConfig,
    /// Consecutive rejections after which an action is dead-lettered.
    /// `None` keeps rejected actions queued forever.
    pub dead_letter_after: Option<u32>,
    /// Store key for the pending queue.
    pub queue_key: String,
    /// Store key for the dead-letter list.
    pub dead_letter_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            dead_letter_after: Some(3),
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            dead_letter_key: DEFAULT_DEAD_LETTER_KEY.to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Set the per-action timeout.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the dead-letter threshold.
    pub fn with_dead_letter_after(mut self, attempts: Option<u32>) -> Self {
        self.dead_letter_after = attempts;
        self
    }
}

/// Serde helper: `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Serde helper: `Duration` as milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
