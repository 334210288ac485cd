//! Key-value persistence boundary for Outbox.
//!
//! The sync engine only needs a durable, string-keyed store with
//! get/set/remove semantics. This crate defines that boundary as a trait
//! and ships two backends plus a registry for resolving them by name.
//!
//! # Design Principles
//! - Backend isolation: no queue or sync logic lives here
//! - Async operations: all I/O operations are async
//! - Whole-value writes: a reader never observes a partially written value

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::FileStore;
pub use memory::MemoryStore;
pub use provider::KeyValueStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
