//! Store traits.
//!
//! All writes are idempotent upserts keyed by id, so callers may retry a
//! failed write with the same record.

use crate::record::{Checkpoint, RecoveryRecord};
use async_trait::async_trait;
use dasas_core::{CheckpointId, Cluster, ClusterId, CoreError, Device, DeviceId, RecoveryId};
use dasas_log::{AuditSink, EventHistory, EventLogEntry};

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Backend I/O failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A record could not be encoded or decoded
    #[error("record encoding error: {0}")]
    Encoding(String),

    /// A checkpoint sequence number was already used for the cluster
    #[error("checkpoint sequence {sequence} already used for {cluster}")]
    SequenceReused {
        /// Cluster
        cluster: ClusterId,
        /// Rejected sequence number
        sequence: u64,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SequenceReused { .. } => CoreError::conflict(err.to_string()),
            other => CoreError::storage(other),
        }
    }
}

/// Durable record of devices and clusters
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Look up a device
    async fn get_device(&self, id: DeviceId) -> StorageResult<Option<Device>>;

    /// Look up a cluster
    async fn get_cluster(&self, id: ClusterId) -> StorageResult<Option<Cluster>>;

    /// Devices whose cluster reference is `cluster`
    async fn list_members(&self, cluster: ClusterId) -> StorageResult<Vec<Device>>;

    /// Every cluster, dissolved ones included
    async fn list_clusters(&self) -> StorageResult<Vec<Cluster>>;

    /// Insert or replace a cluster
    async fn upsert_cluster(&self, cluster: &Cluster) -> StorageResult<()>;

    /// Insert or replace a device
    async fn upsert_device(&self, device: &Device) -> StorageResult<()>;
}

/// Durable checkpoints and recovery markers
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Highest sequence ever committed for the cluster, pruned checkpoints included
    async fn latest_sequence(&self, cluster: ClusterId) -> StorageResult<Option<u64>>;

    /// Retained checkpoint with the highest sequence
    async fn latest_checkpoint(&self, cluster: ClusterId) -> StorageResult<Option<Checkpoint>>;

    /// Retained checkpoint by id
    async fn get_checkpoint(
        &self,
        cluster: ClusterId,
        id: CheckpointId,
    ) -> StorageResult<Option<Checkpoint>>;

    /// Retained checkpoints, newest first
    async fn list_checkpoints(&self, cluster: ClusterId, limit: usize)
    -> StorageResult<Vec<Checkpoint>>;

    /// Write a checkpoint and its audit event together, or neither
    ///
    /// Fails with [`StorageError::SequenceReused`] if the sequence is not
    /// above every sequence already committed for the cluster.
    async fn commit_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        audit: &EventLogEntry,
    ) -> StorageResult<()>;

    /// Drop all but the newest `keep` checkpoints; returns how many were dropped
    async fn prune_checkpoints(&self, cluster: ClusterId, keep: usize) -> StorageResult<usize>;

    /// Insert or replace a recovery record
    async fn put_recovery(&self, record: &RecoveryRecord) -> StorageResult<()>;

    /// Look up a recovery record
    async fn get_recovery(&self, id: RecoveryId) -> StorageResult<Option<RecoveryRecord>>;

    /// The cluster's in-progress recovery, if one exists
    async fn in_progress_recovery(&self, cluster: ClusterId)
    -> StorageResult<Option<RecoveryRecord>>;
}

/// Everything the coordination engine needs from persistence
pub trait Store: MembershipStore + CheckpointStore + AuditSink + EventHistory {}

impl<T> Store for T where T: MembershipStore + CheckpointStore + AuditSink + EventHistory {}
