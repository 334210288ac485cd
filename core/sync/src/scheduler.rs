//! Sync scheduling: trigger delivery to a background pass runner.

use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use outbox_common::EngineError;

use crate::connectivity::{ConnectivityGate, Subscription};
use crate::engine::SyncEngine;
use crate::state::PassReport;

const REQUEST_BUFFER: usize = 16;

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a pass. The responder, if any, receives its report.
    Pass {
        respond_to: Option<oneshot::Sender<Option<PassReport>>>,
    },
    /// Stop the scheduler after pending passes.
    Shutdown,
}

/// Sender side of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SyncRequest>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new() -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        (Self { request_tx }, SyncSchedulerHandle { request_rx })
    }

    /// Create a scheduler and spawn its task for `engine`.
    pub fn spawn(engine: Arc<SyncEngine>) -> (Self, JoinHandle<()>) {
        let (scheduler, handle) = Self::new();
        let task = tokio::spawn(handle.run(engine));
        (scheduler, task)
    }

    /// Request a pass and wait for its report.
    ///
    /// Returns `Ok(None)` if the pass was skipped (offline or already
    /// syncing).
    pub async fn request_sync(&self) -> Result<Option<PassReport>, EngineError> {
        let (respond_to, response) = oneshot::channel();

        self.request_tx
            .send(SyncRequest::Pass {
                respond_to: Some(respond_to),
            })
            .await
            .map_err(|_| EngineError::SchedulerStopped)?;

        response.await.map_err(|_| EngineError::SchedulerStopped)
    }

    /// Ask for a pass without waiting.
    ///
    /// # Returns
    /// `false` only if the scheduler has stopped. A full buffer already
    /// holds a pending pass, so the trigger is folded into it.
    pub fn trigger(&self) -> bool {
        try_trigger(&self.request_tx)
    }

    /// Trigger a pass on every transition of `gate` into `Online`.
    ///
    /// If the gate is already online a pass is triggered right away. The
    /// listener is removed when the returned subscription is dropped.
    #[must_use = "dropping the subscription detaches the scheduler"]
    pub fn attach(&self, gate: &ConnectivityGate) -> Subscription {
        let request_tx = self.request_tx.clone();
        let subscription = gate.subscribe(move |state| {
            if state.is_online() {
                try_trigger(&request_tx);
            }
        });

        if gate.is_online() {
            self.trigger();
        }
        subscription
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SyncRequest::Shutdown).await;
    }

    /// Whether the scheduler task is still receiving requests.
    pub fn is_running(&self) -> bool {
        !self.request_tx.is_closed()
    }
}

fn try_trigger(request_tx: &mpsc::Sender<SyncRequest>) -> bool {
    match request_tx.try_send(SyncRequest::Pass { respond_to: None }) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Receiver side of the scheduler; consumed by `run`.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<SyncRequest>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// Pass requests that queued up while a pass was running are coalesced
    /// into a single pass whose report goes to every waiting requester.
    /// The loop ends on `Shutdown` or once every sender is gone.
    pub async fn run(mut self, engine: Arc<SyncEngine>) {
        info!("Sync scheduler started");

        while let Some(request) = self.request_rx.recv().await {
            let mut waiters = Vec::new();
            let mut shutdown = false;

            match request {
                SyncRequest::Pass { respond_to } => waiters.extend(respond_to),
                SyncRequest::Shutdown => break,
            }

            while let Ok(request) = self.request_rx.try_recv() {
                match request {
                    SyncRequest::Pass { respond_to } => waiters.extend(respond_to),
                    SyncRequest::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
            }

            debug!("Running sync pass for {} waiting requesters", waiters.len());
            let report = engine.trigger_sync().await;
            for waiter in waiters {
                let _ = waiter.send(report.clone());
            }

            if shutdown {
                break;
            }
        }

        info!("Sync scheduler shutting down");
    }
}
