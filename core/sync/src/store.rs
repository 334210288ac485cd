//! Durable, ordered store of pending actions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use outbox_common::{ActionId, StoreError, StoreResult, Timestamp};
use outbox_storage::KeyValueStore;

use crate::action::PendingAction;
use crate::config::{DEFAULT_DEAD_LETTER_KEY, DEFAULT_QUEUE_KEY};

/// An action that stopped being retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The action as it was queued.
    pub action: PendingAction,
    /// Last error reported for it.
    pub reason: String,
    /// When it was moved out of the queue.
    pub dead_lettered_at: Timestamp,
}

/// Ordered persistence for pending actions.
///
/// The queue is kept as a JSON array under a single key of the underlying
/// key-value store, in insertion order. Every operation, reads included,
/// goes through one async mutex: mutations are single-writer and a reader
/// never sees a half-applied change.
pub struct ActionStore {
    kv: Arc<dyn KeyValueStore>,
    queue_key: String,
    dead_letter_key: String,
    lock: Mutex<()>,
}

impl ActionStore {
    /// Create a store over `kv` using the default keys.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_keys(kv, DEFAULT_QUEUE_KEY, DEFAULT_DEAD_LETTER_KEY)
    }

    /// Create a store with explicit keys, so several queues can share a backend.
    pub fn with_keys(
        kv: Arc<dyn KeyValueStore>,
        queue_key: impl Into<String>,
        dead_letter_key: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            queue_key: queue_key.into(),
            dead_letter_key: dead_letter_key.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append an action to the tail of the queue.
    ///
    /// The action is validated first. If its timestamp is older than the
    /// current tail (wall clock moved backwards across a restart), it is
    /// stamped just after the tail so replay order equals insertion order.
    ///
    /// # Errors
    /// - `StoreError::InvalidAction` for a malformed action or a duplicate id
    /// - `StoreError::Io` if the backend write fails; the queue is unchanged
    pub async fn enqueue(&self, mut action: PendingAction) -> StoreResult<()> {
        action.validate()?;

        let _guard = self.lock.lock().await;
        let mut queue: Vec<PendingAction> = self.load(&self.queue_key).await?;

        if queue.iter().any(|a| a.id == action.id) {
            return Err(StoreError::InvalidAction(format!(
                "Action {} is already queued",
                action.id
            )));
        }

        if let Some(tail) = queue.last() {
            if action.enqueued_at < tail.enqueued_at {
                action.enqueued_at = tail.enqueued_at.successor();
            }
        }

        debug!(
            "Enqueueing {} {} action {}",
            action.kind, action.entity, action.id
        );
        queue.push(action);
        self.save(&self.queue_key, &queue).await
    }

    /// All pending actions in insertion order.
    pub async fn list_all(&self) -> StoreResult<Vec<PendingAction>> {
        let _guard = self.lock.lock().await;
        self.load(&self.queue_key).await
    }

    /// Look up a single pending action.
    pub async fn get(&self, id: &ActionId) -> StoreResult<Option<PendingAction>> {
        Ok(self.list_all().await?.into_iter().find(|a| &a.id == id))
    }

    /// Remove the action with `id`. Removing an unknown id succeeds.
    pub async fn remove(&self, id: &ActionId) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut queue: Vec<PendingAction> = self.load(&self.queue_key).await?;

        let before = queue.len();
        queue.retain(|a| &a.id != id);
        if queue.len() == before {
            debug!("Remove of unknown action {} ignored", id);
            return Ok(());
        }

        self.save(&self.queue_key, &queue).await
    }

    /// Empty the queue. Dead letters are kept.
    pub async fn clear_all(&self) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        self.kv.remove(&self.queue_key).await?;
        info!("Cleared pending action queue");
        Ok(())
    }

    /// Number of pending actions.
    pub async fn len(&self) -> StoreResult<usize> {
        Ok(self.list_all().await?.len())
    }

    /// Check if the queue is empty.
    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Move an action from the queue to the dead-letter list.
    ///
    /// The dead-letter entry is written before the queue entry is removed,
    /// so a crash in between leaves the action in both lists rather than
    /// losing it. `requeue_dead_letter` tolerates that state.
    pub async fn dead_letter(
        &self,
        action: &PendingAction,
        reason: impl Into<String>,
    ) -> StoreResult<()> {
        let _guard = self.lock.lock().await;

        let mut letters: Vec<DeadLetter> = self.load(&self.dead_letter_key).await?;
        if !letters.iter().any(|l| l.action.id == action.id) {
            letters.push(DeadLetter {
                action: action.clone(),
                reason: reason.into(),
                dead_lettered_at: Timestamp::now(),
            });
            self.save(&self.dead_letter_key, &letters).await?;
        }

        let mut queue: Vec<PendingAction> = self.load(&self.queue_key).await?;
        queue.retain(|a| a.id != action.id);
        self.save(&self.queue_key, &queue).await?;

        warn!("Moved action {} to dead letters", action.id);
        Ok(())
    }

    /// All dead-lettered actions, oldest first.
    pub async fn list_dead_letters(&self) -> StoreResult<Vec<DeadLetter>> {
        let _guard = self.lock.lock().await;
        self.load(&self.dead_letter_key).await
    }

    /// Drop every dead-lettered action.
    pub async fn clear_dead_letters(&self) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        self.kv.remove(&self.dead_letter_key).await
    }

    /// Put a dead-lettered action back at the tail of the queue.
    ///
    /// # Returns
    /// `false` if no dead letter has this id.
    pub async fn requeue_dead_letter(&self, id: &ActionId) -> StoreResult<bool> {
        let _guard = self.lock.lock().await;

        let mut letters: Vec<DeadLetter> = self.load(&self.dead_letter_key).await?;
        let Some(pos) = letters.iter().position(|l| &l.action.id == id) else {
            return Ok(false);
        };

        let mut action = letters[pos].action.clone();
        let mut queue: Vec<PendingAction> = self.load(&self.queue_key).await?;

        if !queue.iter().any(|a| &a.id == id) {
            let stamp = Timestamp::now();
            action.enqueued_at = match queue.last() {
                Some(tail) if stamp <= tail.enqueued_at => tail.enqueued_at.successor(),
                _ => stamp,
            };
            queue.push(action);
            self.save(&self.queue_key, &queue).await?;
        }

        letters.remove(pos);
        self.save(&self.dead_letter_key, &letters).await?;

        info!("Requeued dead-lettered action {}", id);
        Ok(true)
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Vec<T>> {
        match self.kv.get(key).await? {
            Some(json) if !json.trim().is_empty() => Ok(serde_json::from_str(&json)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, items: &[T]) -> StoreResult<()> {
        let json = serde_json::to_string(items)?;
        self.kv.set(key, &json).await
    }
}
