//! Common types used throughout Outbox.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Unique identifier for a pending action.
///
/// Freshly generated ids are random v4 UUIDs, so an id that has been
/// removed from a queue is never handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn parse(id: impl Into<String>) -> Result<Self, crate::StoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::StoreError::InvalidAction(
                "ActionId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last value handed out by `Timestamp::now`.
static LAST_TICK: AtomicI64 = AtomicI64::new(i64::MIN);

/// Microseconds since the Unix epoch.
///
/// `Timestamp::now` never goes backwards within a process, even if the
/// wall clock does: each call returns a value strictly greater than the
/// previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current time, strictly increasing per process.
    pub fn now() -> Self {
        let wall = Utc::now().timestamp_micros();
        let mut prev = LAST_TICK.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match LAST_TICK.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Self(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Build from raw microseconds.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Raw microseconds since the epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// The next representable instant.
    pub fn successor(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Convert to a calendar time for display.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}
