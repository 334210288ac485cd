//! Common utilities and types shared across Outbox crates.
//!
//! This module provides the error taxonomy and the identifier/timestamp
//! types that the storage and sync crates agree on.

pub mod error;
pub mod types;

pub use error::{EngineError, ExecError, ExecResult, StoreError, StoreResult};
pub use types::{ActionId, Timestamp};
