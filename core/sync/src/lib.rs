//! Outbox Sync Engine
//!
//! Offline mutation queue and replay engine:
//! - Durable, ordered queue of pending actions over a key-value store
//! - Connectivity gate with transition events
//! - Sequential replay that stops at the first failure
//! - Dead-lettering of repeatedly rejected actions
//! - Background scheduler driven by connectivity and manual triggers

pub mod action;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod executor;
pub mod http;
pub mod observer;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export main types
pub use action::{ActionKind, ActionPayload, PendingAction};
pub use config::SyncConfig;
pub use connectivity::{ConnState, ConnectivityGate, ConnectivityProbe, Subscription};
pub use engine::SyncEngine;
pub use executor::{ActionExecutor, AssetUpload, MutationRequest, RemoteApi, RemoteExecutor};
pub use http::{HttpRemote, HttpSetupError};
pub use observer::{SyncObserver, SyncSnapshot};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{PassOutcome, PassReport, SyncRunState, SyncStatus};
pub use store::{ActionStore, DeadLetter};
