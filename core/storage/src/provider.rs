//! Key-value store trait definition.

use async_trait::async_trait;

use outbox_common::StoreResult;

/// Durable string-keyed storage.
///
/// Implementations are provided by the host platform (mobile key/value
/// storage, a directory on disk, ...). Values are opaque strings.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing has been stored under the key.
    ///
    /// # Errors
    /// - I/O errors from the backend
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - A subsequent `get` returns either the old value or the complete
    ///   new value, never a mix of both
    ///
    /// # Errors
    /// - I/O errors from the backend
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove the value under `key`. Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> StoreResult<()>;
}
