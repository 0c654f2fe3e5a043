//! DASAS Storage
//!
//! The membership store (devices and clusters), checkpoint and recovery
//! persistence, and the audit log, behind async traits. Two backends ship:
//! [`MemoryStore`] for tests and demos, [`RedbStore`] for a durable single
//! file database.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod durable;
pub mod memory;
pub mod record;
pub mod store;

pub use durable::RedbStore;
pub use memory::MemoryStore;
pub use record::{Checkpoint, RecoveryRecord, RecoveryStatus};
pub use store::{CheckpointStore, MembershipStore, StorageError, StorageResult, Store};
