//! Turning pending actions into remote effects.
//!
//! `ActionExecutor` is the seam the engine drives. `RemoteExecutor` is the
//! standard implementation: it dispatches on the action's kind and payload
//! and hands the resulting request to a `RemoteApi` supplied by the host's
//! API client layer.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use outbox_common::{ExecError, ExecResult};

use crate::action::{ActionKind, ActionPayload, PendingAction};
use crate::config::SyncConfig;
use crate::retry::RetryExecutor;

/// Executes one pending action.
///
/// Implementations perform exactly one remote effect and never touch the
/// action store; removing the action after success is the engine's job.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform the remote effect for `action`, returning once it completed.
    async fn execute(&self, action: &PendingAction) -> ExecResult<()>;
}

/// A record mutation to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub entity: String,
    pub kind: ActionKind,
    pub record_id: Option<String>,
    pub fields: Map<String, Value>,
    /// Stable across replays of the same action.
    pub idempotency_key: String,
}

/// A binary asset to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetUpload {
    pub entity: String,
    pub destination: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub idempotency_key: String,
}

/// Remote capabilities owned by the host's API client layer.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Apply a record mutation remotely.
    async fn submit_mutation(&self, request: &MutationRequest) -> ExecResult<()>;

    /// Upload a binary asset to its destination.
    async fn upload_asset(&self, upload: &AssetUpload) -> ExecResult<()>;
}

/// Request built from a pending action.
#[derive(Debug, Clone, PartialEq)]
enum RemoteCall {
    Mutation(MutationRequest),
    Upload(AssetUpload),
}

/// Executor that forwards actions to a `RemoteApi`.
///
/// Every action is bounded by the configured timeout, which covers the
/// whole call including in-call retries of transport failures.
pub struct RemoteExecutor<R: RemoteApi + ?Sized> {
    remote: Arc<R>,
    action_timeout: Duration,
    retry: RetryExecutor,
}

impl<R: RemoteApi + ?Sized> RemoteExecutor<R> {
    /// Create an executor from a sync configuration.
    pub fn new(remote: Arc<R>, config: &SyncConfig) -> Self {
        Self {
            remote,
            action_timeout: config.action_timeout,
            retry: RetryExecutor::new(config.retry.clone()),
        }
    }

    async fn build_call(&self, action: &PendingAction) -> ExecResult<RemoteCall> {
        let idempotency_key = action.id.to_string();

        match &action.payload {
            ActionPayload::Asset {
                file,
                destination,
                content_type,
            } => {
                let data = read_asset(file).await?;
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| action.id.to_string());

                Ok(RemoteCall::Upload(AssetUpload {
                    entity: action.entity.clone(),
                    destination: destination.clone(),
                    file_name,
                    content_type: content_type.clone(),
                    data,
                    idempotency_key,
                }))
            }
            ActionPayload::Fields { fields } => Ok(RemoteCall::Mutation(MutationRequest {
                entity: action.entity.clone(),
                kind: action.kind,
                record_id: action.record_id.clone(),
                fields: fields.clone(),
                idempotency_key,
            })),
            ActionPayload::Empty => Ok(RemoteCall::Mutation(MutationRequest {
                entity: action.entity.clone(),
                kind: action.kind,
                record_id: action.record_id.clone(),
                fields: Map::new(),
                idempotency_key,
            })),
        }
    }

    async fn dispatch(&self, call: &RemoteCall) -> ExecResult<()> {
        self.retry
            .execute(|| async move {
                match call {
                    RemoteCall::Mutation(request) => self.remote.submit_mutation(request).await,
                    RemoteCall::Upload(upload) => self.remote.upload_asset(upload).await,
                }
            })
            .await
    }
}

#[async_trait]
impl<R: RemoteApi + ?Sized> ActionExecutor for RemoteExecutor<R> {
    async fn execute(&self, action: &PendingAction) -> ExecResult<()> {
        debug!(
            "Executing {} {} action {}",
            action.kind, action.entity, action.id
        );

        let run = async {
            let call = self.build_call(action).await?;
            self.dispatch(&call).await
        };

        match timeout(self.action_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout(self.action_timeout)),
        }
    }
}

/// Read the local file behind an asset action.
///
/// A missing file can never succeed later, so it is reported as a
/// rejection rather than a transient failure.
async fn read_asset(path: &Path) -> ExecResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ExecError::Rejected(format!(
            "Local asset not found: {}",
            path.display()
        ))),
        Err(e) => Err(ExecError::Network(format!(
            "Failed to read local asset {}: {}",
            path.display(),
            e
        ))),
    }
}
