//! Mailforge Store - Persistence layer
//!
//! This crate provides the durable state for the sending engine: the
//! whole-file JSON snapshot holding per-user quota, credential and campaign
//! state, and the advisory per-user exclusivity lock that keeps two workers
//! from racing on the same user's record.

pub mod lock;
pub mod models;
pub mod snapshot;

pub use lock::UserLock;
pub use models::*;
pub use snapshot::{Snapshot, SnapshotStore};
