//! Connectivity gate: current network state plus transition events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

/// Reachability of the remote side as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Online,
    Offline,
    /// No report received yet.
    Unknown,
}

impl ConnState {
    /// Map a boolean platform signal.
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnState::Online
        } else {
            ConnState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ConnState::Online)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Online => "online",
            ConnState::Offline => "offline",
            ConnState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Pull-based connectivity check provided by the host.
pub trait ConnectivityProbe: Send + Sync {
    /// Ask the platform for the current state.
    fn check(&self) -> ConnState;
}

type Listener = Arc<dyn Fn(ConnState) + Send + Sync>;

struct GateInner {
    state: ConnState,
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
}

/// Tracks connectivity and fans out state changes to subscribers.
///
/// Listeners are called once per actual change, never for a repeated
/// report of the same state, so "became online" fires exactly once per
/// transition. Cloning the gate yields another handle to the same state.
#[derive(Clone)]
pub struct ConnectivityGate {
    inner: Arc<Mutex<GateInner>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl ConnectivityGate {
    /// Create a gate in the `Unknown` state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                state: ConnState::Unknown,
                listeners: BTreeMap::new(),
                next_id: 0,
            })),
            probe: None,
        }
    }

    /// Create a gate that can pull state from `probe` on `refresh`.
    pub fn with_probe(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            probe: Some(probe),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Point-in-time snapshot.
    pub fn current_state(&self) -> ConnState {
        self.lock().state
    }

    /// Shorthand for `current_state() == Online`.
    pub fn is_online(&self) -> bool {
        self.current_state().is_online()
    }

    /// Feed a platform report into the gate.
    ///
    /// # Returns
    /// `true` if the state changed and listeners were notified.
    pub fn report(&self, state: ConnState) -> bool {
        let listeners: Vec<Listener> = {
            let mut inner = self.lock();
            if inner.state == state {
                return false;
            }
            let previous = inner.state;
            inner.state = state;
            if state.is_online() {
                info!("Connectivity: {} -> {}", previous, state);
            } else {
                debug!("Connectivity: {} -> {}", previous, state);
            }
            inner.listeners.values().cloned().collect()
        };

        // Called without the lock held so listeners may query the gate.
        for listener in listeners {
            listener(state);
        }
        true
    }

    /// Feed a boolean platform signal into the gate.
    pub fn set_online(&self, online: bool) -> bool {
        self.report(ConnState::from_online(online))
    }

    /// Pull the state from the probe, if any, and report it.
    pub fn refresh(&self) -> ConnState {
        if let Some(probe) = &self.probe {
            let state = probe.check();
            self.report(state);
        }
        self.current_state()
    }

    /// Register a listener for every state change.
    ///
    /// The listener stays registered until the returned handle is dropped
    /// or `unsubscribe` is called on it.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, Arc::new(listener));

        Subscription {
            id,
            gate: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Handle that reads the gate back without keeping it alive.
    pub(crate) fn downgrade(&self) -> WeakGate {
        WeakGate(Arc::downgrade(&self.inner))
    }
}

/// Non-owning view of a gate, safe to capture in its own listeners.
pub(crate) struct WeakGate(Weak<Mutex<GateInner>>);

impl WeakGate {
    /// Current state, or `None` once every gate handle is gone.
    pub(crate) fn current_state(&self) -> Option<ConnState> {
        let inner = self.0.upgrade()?;
        let state = inner.lock().unwrap_or_else(|e| e.into_inner()).state;
        Some(state)
    }
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered listener. Dropping it unregisters the listener.
pub struct Subscription {
    id: u64,
    gate: Weak<Mutex<GateInner>>,
}

impl Subscription {
    /// Unregister the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.gate.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn recorder(gate: &ConnectivityGate) -> (Arc<Mutex<Vec<ConnState>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = gate.subscribe(move |state| sink.lock().unwrap().push(state));
        (seen, sub)
    }

    #[test]
    fn test_starts_unknown() {
        let gate = ConnectivityGate::new();
        assert_eq!(gate.current_state(), ConnState::Unknown);
        assert!(!gate.is_online());
    }

    #[test]
    fn test_notifies_each_transition_once() {
        let gate = ConnectivityGate::new();
        let (seen, _sub) = recorder(&gate);

        assert!(gate.set_online(true));
        assert!(!gate.set_online(true));
        assert!(!gate.set_online(true));
        assert!(gate.set_online(false));
        assert!(gate.set_online(true));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnState::Online, ConnState::Offline, ConnState::Online]
        );
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let gate = ConnectivityGate::new();
        let (seen, sub) = recorder(&gate);
        assert_eq!(gate.listener_count(), 1);

        sub.unsubscribe();
        assert_eq!(gate.listener_count(), 0);

        gate.set_online(true);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let gate = ConnectivityGate::new();
        {
            let (_seen, _sub) = recorder(&gate);
            assert_eq!(gate.listener_count(), 1);
        }
        assert_eq!(gate.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_gate() {
        let gate = ConnectivityGate::new();
        let (_seen, sub) = recorder(&gate);
        drop(gate);
        drop(sub);
    }

    #[test]
    fn test_listener_can_query_gate() {
        let gate = ConnectivityGate::new();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let handle = gate.clone();
        let _sub = gate.subscribe(move |_| {
            *sink.lock().unwrap() = Some(handle.current_state());
        });

        gate.set_online(true);
        assert_eq!(*observed.lock().unwrap(), Some(ConnState::Online));
    }

    struct ScriptedProbe(AtomicU8);

    impl ConnectivityProbe for ScriptedProbe {
        fn check(&self) -> ConnState {
            ConnState::from_online(self.0.load(Ordering::SeqCst) == 1)
        }
    }

    #[test]
    fn test_refresh_pulls_from_probe() {
        let probe = Arc::new(ScriptedProbe(AtomicU8::new(1)));
        let gate = ConnectivityGate::with_probe(probe.clone());
        let (seen, _sub) = recorder(&gate);

        assert_eq!(gate.refresh(), ConnState::Online);
        probe.0.store(0, Ordering::SeqCst);
        assert_eq!(gate.refresh(), ConnState::Offline);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnState::Online, ConnState::Offline]
        );
    }

    #[test]
    fn test_weak_gate_does_not_keep_gate_alive() {
        let gate = ConnectivityGate::new();
        let weak = gate.downgrade();
        gate.set_online(true);
        assert_eq!(weak.current_state(), Some(ConnState::Online));

        drop(gate);
        assert_eq!(weak.current_state(), None);
    }

    #[test]
    fn test_refresh_without_probe_keeps_state() {
        let gate = ConnectivityGate::new();
        gate.set_online(false);
        assert_eq!(gate.refresh(), ConnState::Offline);
    }
}
