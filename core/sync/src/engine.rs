//! Sync engine that drains the pending-action queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outbox_common::{ActionId, EngineError, ExecError, Timestamp};

use crate::action::PendingAction;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityGate, Subscription};
use crate::executor::ActionExecutor;
use crate::observer::SyncObserver;
use crate::scheduler::SyncScheduler;
use crate::state::{PassOutcome, PassReport, SyncRunState};
use crate::store::ActionStore;

/// Replays pending actions against the remote side, one pass at a time.
///
/// A pass snapshots the queue, orders it by enqueue time and executes the
/// actions sequentially. It stops at the first failure or as soon as the
/// gate reports the remote unreachable. At most one pass runs at a time.
pub struct SyncEngine {
    store: Arc<ActionStore>,
    gate: ConnectivityGate,
    executor: Arc<dyn ActionExecutor>,
    config: SyncConfig,
    /// Mutual exclusion for passes.
    syncing: AtomicBool,
    state: Arc<watch::Sender<SyncRunState>>,
    /// Consecutive rejections per action, reset on success.
    rejections: Mutex<HashMap<ActionId, u32>>,
    _connectivity: Subscription,
}

impl SyncEngine {
    /// Create an engine over an injected store, gate and executor.
    pub fn new(
        store: Arc<ActionStore>,
        gate: ConnectivityGate,
        executor: Arc<dyn ActionExecutor>,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncRunState::default());
        let state = Arc::new(state);

        let mirror = state.clone();
        let latest = gate.downgrade();
        let connectivity = gate.subscribe(move |_| {
            // Concurrent reports may deliver out of order. Reading the gate
            // under the watch lock leaves the newest state in place.
            mirror.send_modify(|s| {
                if let Some(conn) = latest.current_state() {
                    s.connectivity = conn;
                }
            });
        });
        let current = gate.current_state();
        state.send_modify(|s| s.connectivity = current);

        Self {
            store,
            gate,
            executor,
            config,
            syncing: AtomicBool::new(false),
            state,
            rejections: Mutex::new(HashMap::new()),
            _connectivity: connectivity,
        }
    }

    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    pub fn gate(&self) -> &ConnectivityGate {
        &self.gate
    }

    /// Whether a pass is in flight.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Completion time of the last pass that drained the queue.
    pub fn last_sync_at(&self) -> Option<Timestamp> {
        self.state.borrow().last_sync_at
    }

    /// Current run state.
    pub fn state(&self) -> SyncRunState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every run-state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncRunState> {
        self.state.subscribe()
    }

    /// Read-only view for display.
    pub fn observer(&self) -> SyncObserver {
        SyncObserver::new(
            self.store.clone(),
            self.gate.clone(),
            self.state.subscribe(),
        )
    }

    /// Spawn a scheduler task that runs passes for this engine.
    pub fn spawn_scheduler(self: &Arc<Self>) -> (SyncScheduler, JoinHandle<()>) {
        SyncScheduler::spawn(self.clone())
    }

    /// Run one pass, swallowing the reasons a pass may be skipped.
    ///
    /// This is the entry point for UI retry buttons and connectivity
    /// triggers; a skipped pass is not an error for them.
    pub async fn trigger_sync(&self) -> Option<PassReport> {
        match self.run_sync_pass().await {
            Ok(report) => Some(report),
            Err(e) => {
                debug!("Sync pass skipped: {}", e);
                None
            }
        }
    }

    /// Run one sync pass.
    ///
    /// # Errors
    /// `EngineError::Offline` if the gate is not online, and
    /// `EngineError::AlreadySyncing` if another pass is in flight. In both
    /// cases nothing is executed and the store is untouched.
    pub async fn run_sync_pass(&self) -> Result<PassReport, EngineError> {
        if !self.gate.is_online() {
            return Err(EngineError::Offline);
        }
        let _guard = self.begin_pass().ok_or(EngineError::AlreadySyncing)?;

        let started_at = Timestamp::now();
        let clock = Instant::now();
        let (executed, remaining, outcome) = self.drain().await;

        let report = PassReport {
            started_at,
            duration: clock.elapsed(),
            executed,
            remaining,
            outcome,
        };

        match &report.outcome {
            PassOutcome::Drained => {
                info!("Sync pass drained {} actions", executed);
            }
            PassOutcome::Stopped {
                action_id, error, ..
            } => {
                warn!(
                    "Sync pass stopped at {}: {} ({} executed, {} remaining)",
                    action_id, error, executed, remaining
                );
            }
            PassOutcome::WentOffline => {
                info!(
                    "Sync pass aborted offline ({} executed, {} remaining)",
                    executed, remaining
                );
            }
            PassOutcome::StoreFailed { error } => {
                warn!("Sync pass stopped on store failure: {}", error);
            }
        }

        let drained = report.is_drained();
        let published = report.clone();
        self.state.send_modify(move |s| {
            if drained {
                s.last_sync_at = Some(Timestamp::now());
            }
            s.last_report = Some(published);
        });

        Ok(report)
    }

    fn begin_pass(&self) -> Option<PassGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.state.send_modify(|s| s.is_syncing = true);
        Some(PassGuard { engine: self })
    }

    /// Execute the queue snapshot. Returns executed, remaining, outcome.
    async fn drain(&self) -> (usize, usize, PassOutcome) {
        let mut actions = match self.store.list_all().await {
            Ok(actions) => actions,
            Err(e) => {
                return (
                    0,
                    0,
                    PassOutcome::StoreFailed {
                        error: e.to_string(),
                    },
                )
            }
        };

        // Stable, so ties keep their persisted order.
        actions.sort_by_key(|a| a.enqueued_at);
        self.forget_rejections_except(&actions);

        let total = actions.len();
        debug!("Sync pass started with {} pending actions", total);

        let mut executed = 0;
        for action in &actions {
            if !self.gate.is_online() {
                return (executed, total - executed, PassOutcome::WentOffline);
            }

            match self.executor.execute(action).await {
                Ok(()) => {
                    self.reset_rejections(&action.id);
                    if let Err(e) = self.store.remove(&action.id).await {
                        return (
                            executed,
                            total - executed,
                            PassOutcome::StoreFailed {
                                error: e.to_string(),
                            },
                        );
                    }
                    executed += 1;
                    debug!("Synced {} {} action {}", action.kind, action.entity, action.id);
                }
                Err(error) => {
                    let outcome = self.handle_failure(action, error).await;
                    let dead_lettered = matches!(
                        outcome,
                        PassOutcome::Stopped {
                            dead_lettered: true,
                            ..
                        }
                    );
                    let remaining = total - executed - usize::from(dead_lettered);
                    return (executed, remaining, outcome);
                }
            }
        }

        (executed, 0, PassOutcome::Drained)
    }

    async fn handle_failure(&self, action: &PendingAction, error: ExecError) -> PassOutcome {
        let mut dead_lettered = false;

        if let ExecError::Rejected(reason) = &error {
            let attempts = self.record_rejection(&action.id);
            debug!("Action {} rejected {} time(s)", action.id, attempts);

            if let Some(limit) = self.config.dead_letter_after {
                if attempts >= limit {
                    if let Err(e) = self.store.dead_letter(action, reason.clone()).await {
                        return PassOutcome::StoreFailed {
                            error: e.to_string(),
                        };
                    }
                    self.reset_rejections(&action.id);
                    dead_lettered = true;
                }
            }
        }

        PassOutcome::Stopped {
            action_id: action.id.clone(),
            error: error.to_string(),
            dead_lettered,
        }
    }

    fn rejections(&self) -> std::sync::MutexGuard<'_, HashMap<ActionId, u32>> {
        self.rejections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_rejection(&self, id: &ActionId) -> u32 {
        let mut rejections = self.rejections();
        let count = rejections.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_rejections(&self, id: &ActionId) {
        self.rejections().remove(id);
    }

    /// Drop counters for actions no longer queued.
    fn forget_rejections_except(&self, actions: &[PendingAction]) {
        let mut rejections = self.rejections();
        if !rejections.is_empty() {
            rejections.retain(|id, _| actions.iter().any(|a| &a.id == id));
        }
    }
}

/// Clears the syncing flag when a pass ends, however it ends.
struct PassGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.engine.syncing.store(false, Ordering::Release);
        self.engine.state.send_modify(|s| s.is_syncing = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnState;
    use async_trait::async_trait;
    use crate::state::SyncStatus;
    use outbox_common::{ExecResult, StoreError, StoreResult};
    use outbox_storage::{KeyValueStore, MemoryStore};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Executor that replays scripted results and records call order.
    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<VecDeque<ExecResult<()>>>,
        calls: Mutex<Vec<ActionId>>,
    }

    impl ScriptedExecutor {
        fn with_script(results: Vec<ExecResult<()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ActionId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(&self, action: &PendingAction) -> ExecResult<()> {
            self.calls.lock().unwrap().push(action.id.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn engine_with(
        executor: Arc<ScriptedExecutor>,
        config: SyncConfig,
    ) -> (SyncEngine, Arc<ActionStore>, ConnectivityGate) {
        let store = Arc::new(ActionStore::new(Arc::new(MemoryStore::new())));
        let gate = ConnectivityGate::new();
        let engine = SyncEngine::new(store.clone(), gate.clone(), executor, config);
        (engine, store, gate)
    }

    fn action(n: u32) -> PendingAction {
        PendingAction::update(
            "item",
            format!("i-{}", n),
            json!({"n": n}).as_object().cloned().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_offline_pass_is_refused() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, store, gate) = engine_with(executor.clone(), SyncConfig::default());
        store.enqueue(action(1)).await.unwrap();

        assert_eq!(engine.run_sync_pass().await, Err(EngineError::Offline));
        gate.set_online(false);
        assert!(engine.trigger_sync().await.is_none());

        assert!(executor.calls().is_empty());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drained_pass_sets_last_sync() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, store, gate) = engine_with(executor.clone(), SyncConfig::default());
        store.enqueue(action(1)).await.unwrap();
        store.enqueue(action(2)).await.unwrap();
        gate.set_online(true);

        let report = engine.run_sync_pass().await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Drained);
        assert_eq!(report.executed, 2);
        assert_eq!(report.remaining, 0);
        assert!(store.is_empty().await.unwrap());
        assert!(engine.last_sync_at().is_some());
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_empty_queue_counts_as_drained() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, _store, gate) = engine_with(executor, SyncConfig::default());
        gate.set_online(true);

        let report = engine.trigger_sync().await.unwrap();
        assert!(report.is_drained());
        assert!(engine.last_sync_at().is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_pass() {
        let executor = ScriptedExecutor::with_script(vec![
            Ok(()),
            Err(ExecError::Network("reset".to_string())),
        ]);
        let (engine, store, gate) = engine_with(executor.clone(), SyncConfig::default());
        let (a1, a2, a3) = (action(1), action(2), action(3));
        for a in [&a1, &a2, &a3] {
            store.enqueue(a.clone()).await.unwrap();
        }
        gate.set_online(true);

        let report = engine.run_sync_pass().await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.remaining, 2);
        assert!(matches!(
            report.outcome,
            PassOutcome::Stopped { ref action_id, dead_lettered: false, .. } if *action_id == a2.id
        ));
        assert_eq!(executor.calls(), vec![a1.id.clone(), a2.id.clone()]);

        let left: Vec<ActionId> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(left, vec![a2.id, a3.id]);
        assert!(engine.last_sync_at().is_none());
    }

    #[tokio::test]
    async fn test_rejections_dead_letter_at_threshold() {
        let rejected = || Err(ExecError::Rejected("422 invalid".to_string()));
        let executor = ScriptedExecutor::with_script(vec![rejected(), rejected()]);
        let config = SyncConfig::default().with_dead_letter_after(Some(2));
        let (engine, store, gate) = engine_with(executor.clone(), config);
        let (a1, a2) = (action(1), action(2));
        store.enqueue(a1.clone()).await.unwrap();
        store.enqueue(a2.clone()).await.unwrap();
        gate.set_online(true);

        let first = engine.run_sync_pass().await.unwrap();
        assert!(matches!(first.outcome, PassOutcome::Stopped { dead_lettered: false, .. }));
        assert_eq!(store.len().await.unwrap(), 2);

        let second = engine.run_sync_pass().await.unwrap();
        assert!(matches!(second.outcome, PassOutcome::Stopped { dead_lettered: true, .. }));
        assert_eq!(second.remaining, 1);

        let dead = store.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].action.id, a1.id);
        assert_eq!(dead[0].reason, "422 invalid");

        // The queue moves on once the blocker is parked.
        let third = engine.run_sync_pass().await.unwrap();
        assert!(third.is_drained());
        assert_eq!(executor.calls(), vec![a1.id.clone(), a1.id, a2.id]);
    }

    #[tokio::test]
    async fn test_network_failures_never_dead_letter() {
        let executor = ScriptedExecutor::with_script(
            (0..5).map(|_| Err(ExecError::Timeout(std::time::Duration::from_secs(30)))).collect(),
        );
        let config = SyncConfig::default().with_dead_letter_after(Some(1));
        let (engine, store, gate) = engine_with(executor, config);
        store.enqueue(action(1)).await.unwrap();
        gate.set_online(true);

        for _ in 0..5 {
            let report = engine.run_sync_pass().await.unwrap();
            assert!(matches!(report.outcome, PassOutcome::Stopped { dead_lettered: false, .. }));
        }
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_disabled() {
        let executor = ScriptedExecutor::with_script(
            (0..4).map(|_| Err(ExecError::Rejected("no".to_string()))).collect(),
        );
        let config = SyncConfig::default().with_dead_letter_after(None);
        let (engine, store, gate) = engine_with(executor, config);
        store.enqueue(action(1)).await.unwrap();
        gate.set_online(true);

        for _ in 0..4 {
            engine.run_sync_pass().await.unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_mirrors_connectivity() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, _store, gate) = engine_with(executor, SyncConfig::default());
        assert_eq!(engine.state().connectivity, ConnState::Unknown);

        gate.set_online(true);
        assert_eq!(engine.state().connectivity, ConnState::Online);
        gate.set_online(false);
        assert_eq!(engine.state().connectivity, ConnState::Offline);
    }

    #[tokio::test]
    async fn test_engine_picks_up_existing_connectivity() {
        let store = Arc::new(ActionStore::new(Arc::new(MemoryStore::new())));
        let gate = ConnectivityGate::new();
        gate.set_online(true);

        let engine = SyncEngine::new(
            store,
            gate.clone(),
            ScriptedExecutor::with_script(vec![]),
            SyncConfig::default(),
        );
        assert!(engine.state().is_online());
        assert_eq!(gate.listener_count(), 1);

        drop(engine);
        assert_eq!(gate.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_report_published_to_state() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, store, gate) = engine_with(executor, SyncConfig::default());
        store.enqueue(action(1)).await.unwrap();
        gate.set_online(true);

        let mut rx = engine.subscribe_state();
        rx.borrow_and_update();
        let report = engine.run_sync_pass().await.unwrap();

        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert!(!state.is_syncing);
        assert_eq!(state.last_report, Some(report));
    }

    /// Memory store whose reads or writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("read error")));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> StoreResult<()> {
            self.inner.remove(key).await
        }
    }

    fn flaky_engine(
        executor: Arc<ScriptedExecutor>,
        config: SyncConfig,
    ) -> (SyncEngine, Arc<ActionStore>, Arc<FlakyStore>, ConnectivityGate) {
        let kv = Arc::new(FlakyStore::default());
        let store = Arc::new(ActionStore::new(kv.clone()));
        let gate = ConnectivityGate::new();
        let engine = SyncEngine::new(store.clone(), gate.clone(), executor, config);
        (engine, store, kv, gate)
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_executed_action() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, store, kv, gate) = flaky_engine(executor.clone(), SyncConfig::default());
        gate.set_online(true);
        engine.run_sync_pass().await.unwrap();
        let synced_at = engine.last_sync_at();
        assert!(synced_at.is_some());

        let (a1, a2) = (action(1), action(2));
        store.enqueue(a1.clone()).await.unwrap();
        store.enqueue(a2.clone()).await.unwrap();
        kv.fail_writes.store(true, Ordering::SeqCst);

        let report = engine.run_sync_pass().await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::StoreFailed { .. }));
        assert_eq!(report.executed, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(executor.calls(), vec![a1.id.clone()]);

        assert_eq!(store.list_all().await.unwrap(), vec![a1, a2]);
        assert_eq!(engine.last_sync_at(), synced_at);
        assert!(!engine.is_syncing());
        assert!(!engine.state().is_syncing);
        assert_eq!(engine.state().last_report, Some(report));
    }

    #[tokio::test]
    async fn test_failed_dead_letter_keeps_action_queued() {
        let rejected = || Err(ExecError::Rejected("422 invalid".to_string()));
        let executor = ScriptedExecutor::with_script(vec![rejected(), rejected()]);
        let config = SyncConfig::default().with_dead_letter_after(Some(1));
        let (engine, store, kv, gate) = flaky_engine(executor, config);
        let a1 = action(1);
        store.enqueue(a1.clone()).await.unwrap();
        kv.fail_writes.store(true, Ordering::SeqCst);
        gate.set_online(true);

        let report = engine.run_sync_pass().await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::StoreFailed { .. }));
        assert_eq!(report.executed, 0);

        assert_eq!(store.list_all().await.unwrap(), vec![a1]);
        assert!(store.list_dead_letters().await.unwrap().is_empty());
        assert!(engine.last_sync_at().is_none());
        assert!(!engine.is_syncing());

        // Once the store recovers the next rejection parks the action.
        kv.fail_writes.store(false, Ordering::SeqCst);
        let retried = engine.run_sync_pass().await.unwrap();
        assert!(matches!(retried.outcome, PassOutcome::Stopped { dead_lettered: true, .. }));
        assert!(store.is_empty().await.unwrap());
        assert_eq!(store.list_dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_queue_fails_pass() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let (engine, store, kv, gate) = flaky_engine(executor.clone(), SyncConfig::default());
        store.enqueue(action(1)).await.unwrap();
        kv.fail_reads.store(true, Ordering::SeqCst);
        gate.set_online(true);

        let report = engine.run_sync_pass().await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::StoreFailed { .. }));
        assert!(executor.calls().is_empty());
        assert!(engine.last_sync_at().is_none());
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_late_notification_keeps_latest_connectivity() {
        let executor = ScriptedExecutor::with_script(vec![]);
        let store = Arc::new(ActionStore::new(Arc::new(MemoryStore::new())));
        let gate = ConnectivityGate::new();

        // Registered ahead of the engine, so it runs first and holds up
        // delivery of the first Online report.
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(Some(release_rx));
        let _host = gate.subscribe(move |conn| {
            if conn.is_online() {
                if let Some(rx) = release_rx.lock().unwrap().take() {
                    entered_tx.send(()).unwrap();
                    rx.recv().unwrap();
                }
            }
        });

        let engine = SyncEngine::new(store, gate.clone(), executor, SyncConfig::default());
        let observer = engine.observer();

        let reporter = gate.clone();
        let slow = std::thread::spawn(move || reporter.set_online(true));
        entered_rx.recv().unwrap();
        assert!(gate.set_online(false));
        release_tx.send(()).unwrap();
        assert!(slow.join().unwrap());

        assert_eq!(gate.current_state(), ConnState::Offline);
        assert_eq!(engine.state().connectivity, ConnState::Offline);

        let snapshot = observer.snapshot().await.unwrap();
        assert_eq!(snapshot.connectivity, ConnState::Offline);
        assert!(!snapshot.is_online);
        assert_eq!(snapshot.status(), SyncStatus::Offline);
    }
}
