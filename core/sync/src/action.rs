//! Pending action model.
//!
//! A `PendingAction` is a durable description of a mutation that could not
//! be applied when the user asked for it. The payload shape is tied to the
//! action kind and is checked before the action is queued.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use outbox_common::{ActionId, StoreError, StoreResult, Timestamp};

/// Kind of deferred mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new record or asset.
    Create,
    /// Modify fields of an existing record.
    Update,
    /// Delete an existing record.
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl FromStr for ActionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ActionKind::Create),
            "update" => Ok(ActionKind::Update),
            "delete" => Ok(ActionKind::Delete),
            other => Err(StoreError::InvalidAction(format!(
                "Unknown action kind: {}",
                other
            ))),
        }
    }
}

/// Data carried by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Field-value map for record mutations.
    Fields { fields: Map<String, Value> },
    /// A local file to upload to a named destination.
    Asset {
        /// Resolved local file.
        file: PathBuf,
        /// Remote destination (collection, bucket path, ...).
        destination: String,
        /// MIME type, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    /// No data beyond the record id.
    Empty,
}

/// A mutation waiting to be replayed against the remote side.
///
/// Actions are immutable once queued; the store only ever appends or
/// removes whole actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Unique id, also sent to the remote as an idempotency key.
    pub id: ActionId,
    /// Kind of mutation.
    pub kind: ActionKind,
    /// Domain object type the action targets (e.g. "product").
    pub entity: String,
    /// Target record for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Action data.
    pub payload: ActionPayload,
    /// Replay order key.
    pub enqueued_at: Timestamp,
}

impl PendingAction {
    fn new(
        kind: ActionKind,
        entity: impl Into<String>,
        record_id: Option<String>,
        payload: ActionPayload,
    ) -> Self {
        Self {
            id: ActionId::generate(),
            kind,
            entity: entity.into(),
            record_id,
            payload,
            enqueued_at: Timestamp::now(),
        }
    }

    /// Create a record from a field map.
    pub fn create(entity: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self::new(ActionKind::Create, entity, None, ActionPayload::Fields { fields })
    }

    /// Update fields of an existing record.
    pub fn update(
        entity: impl Into<String>,
        record_id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(
            ActionKind::Update,
            entity,
            Some(record_id.into()),
            ActionPayload::Fields { fields },
        )
    }

    /// Delete an existing record.
    pub fn delete(entity: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::new(
            ActionKind::Delete,
            entity,
            Some(record_id.into()),
            ActionPayload::Empty,
        )
    }

    /// Upload a local file to `destination`.
    pub fn upload_asset(
        entity: impl Into<String>,
        file: impl Into<PathBuf>,
        destination: impl Into<String>,
    ) -> Self {
        Self::new(
            ActionKind::Create,
            entity,
            None,
            ActionPayload::Asset {
                file: file.into(),
                destination: destination.into(),
                content_type: None,
            },
        )
    }

    /// Attach a client-chosen record id.
    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Set the MIME type of an asset payload. No effect on other payloads.
    pub fn with_content_type(mut self, mime: impl Into<String>) -> Self {
        if let ActionPayload::Asset { content_type, .. } = &mut self.payload {
            *content_type = Some(mime.into());
        }
        self
    }

    /// Whether this action uploads a binary asset.
    pub fn is_asset(&self) -> bool {
        matches!(self.payload, ActionPayload::Asset { .. })
    }

    /// Check that the payload shape matches the kind.
    ///
    /// # Errors
    /// - `StoreError::InvalidAction` describing the first violation
    pub fn validate(&self) -> StoreResult<()> {
        if self.entity.trim().is_empty() {
            return Err(invalid("entity must not be empty"));
        }
        if matches!(&self.record_id, Some(id) if id.trim().is_empty()) {
            return Err(invalid("record id must not be blank"));
        }

        match (self.kind, &self.payload) {
            (ActionKind::Create, ActionPayload::Fields { fields }) if fields.is_empty() => {
                Err(invalid("create requires at least one field"))
            }
            (ActionKind::Create, ActionPayload::Fields { .. }) => Ok(()),
            (ActionKind::Create, ActionPayload::Asset { file, destination, .. }) => {
                if file.as_os_str().is_empty() {
                    Err(invalid("asset file path must not be empty"))
                } else if destination.split('/').all(|s| s.trim().is_empty()) {
                    Err(invalid("asset destination must name a path"))
                } else {
                    Ok(())
                }
            }
            (ActionKind::Create, ActionPayload::Empty) => {
                Err(invalid("create requires fields or an asset"))
            }
            (_, ActionPayload::Asset { .. }) => {
                Err(invalid("asset payloads are only valid for create"))
            }
            (ActionKind::Update, _) | (ActionKind::Delete, _) if self.record_id.is_none() => {
                Err(invalid(&format!("{} requires a record id", self.kind)))
            }
            (ActionKind::Update, ActionPayload::Fields { fields }) if fields.is_empty() => {
                Err(invalid("update requires at least one field"))
            }
            (ActionKind::Update, ActionPayload::Empty) => {
                Err(invalid("update requires fields"))
            }
            (ActionKind::Update, ActionPayload::Fields { .. })
            | (ActionKind::Delete, ActionPayload::Fields { .. })
            | (ActionKind::Delete, ActionPayload::Empty) => Ok(()),
        }
    }
}

fn invalid(msg: &str) -> StoreError {
    StoreError::InvalidAction(msg.to_string())
}
