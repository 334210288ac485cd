//! Read-only projection of sync state for display.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use outbox_common::{StoreResult, Timestamp};

use crate::connectivity::{ConnState, ConnectivityGate};
use crate::state::{PassReport, SyncRunState, SyncStatus};
use crate::store::ActionStore;

/// Point-in-time view of the queue and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub connectivity: ConnState,
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<Timestamp>,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub last_report: Option<PassReport>,
}

impl SyncSnapshot {
    /// Coarse status for display.
    pub fn status(&self) -> SyncStatus {
        if self.is_syncing {
            SyncStatus::Syncing
        } else if self.is_online {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        }
    }

    /// Whether local work is waiting to reach the remote side.
    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }
}

/// Observer handed out by `SyncEngine::observer`. Holds no state of its own.
#[derive(Clone)]
pub struct SyncObserver {
    store: Arc<ActionStore>,
    gate: ConnectivityGate,
    state: watch::Receiver<SyncRunState>,
}

impl SyncObserver {
    pub(crate) fn new(
        store: Arc<ActionStore>,
        gate: ConnectivityGate,
        state: watch::Receiver<SyncRunState>,
    ) -> Self {
        Self { store, gate, state }
    }

    /// Read the current engine state and queue sizes.
    pub async fn snapshot(&self) -> StoreResult<SyncSnapshot> {
        let run = self.state.borrow().clone();
        let connectivity = self.gate.current_state();
        let pending_count = self.store.len().await?;
        let dead_letter_count = self.store.list_dead_letters().await?.len();

        Ok(SyncSnapshot {
            connectivity,
            is_online: connectivity.is_online(),
            is_syncing: run.is_syncing,
            last_sync_at: run.last_sync_at,
            pending_count,
            dead_letter_count,
            last_report: run.last_report,
        })
    }

    /// Receiver of run-state changes, for UIs that want push updates.
    pub fn watch(&self) -> watch::Receiver<SyncRunState> {
        self.state.clone()
    }
}
