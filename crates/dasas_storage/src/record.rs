//! Checkpoint and recovery records.

use chrono::{DateTime, Utc};
use dasas_core::{CheckpointId, ClusterId, Hash, RecoveryId};
use serde::{Deserialize, Serialize};

/// An immutable, sequence-numbered snapshot of agreed cluster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id
    pub id: CheckpointId,
    /// Owning cluster
    pub cluster: ClusterId,
    /// Strictly increasing per cluster, starting at 1
    pub sequence: u64,
    /// Opaque serialized state
    pub data: Vec<u8>,
    /// blake3 digest of `data`
    pub digest: Hash,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint, computing the digest of `data`
    #[must_use]
    pub fn new(cluster: ClusterId, sequence: u64, data: Vec<u8>) -> Self {
        Self {
            id: CheckpointId::new(),
            cluster,
            sequence,
            digest: Hash::compute(&data),
            data,
            created_at: Utc::now(),
        }
    }

    /// Whether the stored digest still matches the data
    #[must_use]
    pub fn verify(&self) -> bool {
        self.digest.verify(&self.data)
    }
}

/// Recovery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Initiated, not yet completed
    InProgress,
    /// Completed successfully
    Succeeded,
    /// Completed with failure
    Failed,
}

impl RecoveryStatus {
    /// Whether the recovery has a terminal outcome
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Two-phase marker around a restoration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Recovery id
    pub id: RecoveryId,
    /// Cluster being recovered
    pub cluster: ClusterId,
    /// Why recovery was started
    pub reason: String,
    /// Lifecycle status
    pub status: RecoveryStatus,
    /// Outcome details supplied on completion
    pub details: Option<String>,
    /// When recovery was initiated
    pub initiated_at: DateTime<Utc>,
    /// When recovery was completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryRecord {
    /// Start a new in-progress recovery
    #[must_use]
    pub fn initiate(cluster: ClusterId, reason: impl Into<String>) -> Self {
        Self {
            id: RecoveryId::new(),
            cluster,
            reason: reason.into(),
            status: RecoveryStatus::InProgress,
            details: None,
            initiated_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record the terminal outcome
    #[must_use]
    pub fn complete(mut self, success: bool, details: impl Into<String>) -> Self {
        self.status = if success {
            RecoveryStatus::Succeeded
        } else {
            RecoveryStatus::Failed
        };
        self.details = Some(details.into());
        self.completed_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_digest() {
        let mut checkpoint = Checkpoint::new(ClusterId::new(), 1, b"state".to_vec());
        assert!(checkpoint.verify());
        checkpoint.data.push(0);
        assert!(!checkpoint.verify());
    }

    #[test]
    fn test_recovery_lifecycle() {
        let record = RecoveryRecord::initiate(ClusterId::new(), "leader lost");
        assert_eq!(record.status, RecoveryStatus::InProgress);
        assert!(!record.status.is_terminal());

        let done = record.complete(false, "no checkpoint");
        assert_eq!(done.status, RecoveryStatus::Failed);
        assert!(done.status.is_terminal());
        assert_eq!(done.details.as_deref(), Some("no checkpoint"));
        assert!(done.completed_at.is_some());
    }
}
