//! Ephemeral sync state and pass reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use outbox_common::{ActionId, Timestamp};

use crate::connectivity::ConnState;

/// Coarse status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not reachable (or not yet known to be); passes will not start.
    Offline,
    /// Online, no pass running.
    Idle,
    /// A pass is draining the queue.
    Syncing,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Offline => "offline",
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
        };
        f.write_str(name)
    }
}

/// How a sync pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every action in the pass snapshot was executed and removed.
    Drained,
    /// An action failed; it and everything after it stay queued.
    Stopped {
        action_id: ActionId,
        error: String,
        /// The failing action was moved to the dead-letter list.
        dead_lettered: bool,
    },
    /// Connectivity dropped mid-pass.
    WentOffline,
    /// The store could not be read or updated.
    StoreFailed { error: String },
}

/// Summary of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub started_at: Timestamp,
    pub duration: Duration,
    /// Actions executed and removed during the pass.
    pub executed: usize,
    /// Actions from the pass snapshot still queued.
    pub remaining: usize,
    pub outcome: PassOutcome,
}

impl PassReport {
    /// Whether the pass emptied its snapshot of the queue.
    pub fn is_drained(&self) -> bool {
        matches!(self.outcome, PassOutcome::Drained)
    }
}

/// Live engine state. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunState {
    pub connectivity: ConnState,
    pub is_syncing: bool,
    /// Set only by passes that drained the queue.
    pub last_sync_at: Option<Timestamp>,
    pub last_report: Option<PassReport>,
}

impl SyncRunState {
    /// Initial state at process start.
    pub fn new(connectivity: ConnState) -> Self {
        Self {
            connectivity,
            is_syncing: false,
            last_sync_at: None,
            last_report: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Coarse status for display.
    pub fn status(&self) -> SyncStatus {
        if self.is_syncing {
            SyncStatus::Syncing
        } else if self.is_online() {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        }
    }
}

impl Default for SyncRunState {
    fn default() -> Self {
        Self::new(ConnState::Unknown)
    }
}
