//! Event log entries.
//!
//! Entries are immutable once built. The optional clock is the cluster's
//! vector clock snapshot at the time the event was recorded.

use chrono::{DateTime, Utc};
use dasas_core::{ClusterId, EventId, VectorClock};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Event kind - type of coordination event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Cluster record created
    ClusterCreated,
    /// Cluster dissolved
    ClusterDissolved,
    /// No leader could be elected
    ClusterDegraded,
    /// Cluster name or settings changed
    ClusterUpdated,
    /// Device registered
    DeviceRegistered,
    /// Device offline
    DeviceOffline,
    /// Member added
    MemberAdded,
    /// Member removed
    MemberRemoved,
    /// Leader elected
    LeaderElected,
    /// Every election attempt timed out
    ElectionFailed,
    /// Leader lost
    LeaderLost,
    /// Leadership claim for an old term
    StaleLeaderRejected,
    /// Resource requested
    ResourceRequested,
    /// Token handed to a device
    ResourceGranted,
    /// Token given up or reclaimed
    ResourceReleased,
    /// Application event recorded on the cluster clock
    VectorClockUpdate,
    /// Agreement proposed
    AgreementProposed,
    /// Agreement committed
    AgreementCommitted,
    /// Agreement aborted
    AgreementAborted,
    /// Member classified faulty
    FaultDetected,
    /// Checkpoint created
    CheckpointCreated,
    /// Checkpoint restored
    CheckpointRestored,
    /// Recovery initiated
    RecoveryInitiated,
    /// Recovery completed
    RecoveryCompleted,
    /// Coordinator state was inconsistent and got resynchronized
    InvariantViolation,
}

impl EventKind {
    /// Wire name, as stored in the audit log
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClusterCreated => "cluster_created",
            Self::ClusterDissolved => "cluster_dissolved",
            Self::ClusterDegraded => "cluster_degraded",
            Self::ClusterUpdated => "cluster_updated",
            Self::DeviceRegistered => "device_registered",
            Self::DeviceOffline => "device_offline",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
            Self::LeaderElected => "leader_elected",
            Self::ElectionFailed => "election_failed",
            Self::LeaderLost => "leader_lost",
            Self::StaleLeaderRejected => "stale_leader_rejected",
            Self::ResourceRequested => "resource_requested",
            Self::ResourceGranted => "resource_granted",
            Self::ResourceReleased => "resource_released",
            Self::VectorClockUpdate => "vector_clock_update",
            Self::AgreementProposed => "agreement_proposed",
            Self::AgreementCommitted => "agreement_committed",
            Self::AgreementAborted => "agreement_aborted",
            Self::FaultDetected => "fault_detected",
            Self::CheckpointCreated => "checkpoint_created",
            Self::CheckpointRestored => "checkpoint_restored",
            Self::RecoveryInitiated => "recovery_initiated",
            Self::RecoveryCompleted => "recovery_completed",
            Self::InvariantViolation => "invariant_violation",
        }
    }

    /// Severity used when the caller does not pick one
    #[must_use]
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::ClusterDegraded
            | Self::ElectionFailed
            | Self::LeaderLost
            | Self::StaleLeaderRejected
            | Self::AgreementAborted
            | Self::FaultDetected
            | Self::RecoveryInitiated => Severity::Warning,
            Self::InvariantViolation => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine coordination
    Info,
    /// Degraded but self-healing
    Warning,
    /// A member misbehaved or an operation failed
    Error,
    /// State was found inconsistent
    Critical,
}

/// One append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Unique entry id
    pub id: EventId,
    /// What happened
    pub kind: EventKind,
    /// Id of the device or cluster that produced the event
    pub source: String,
    /// Cluster the event belongs to, if any
    pub cluster: Option<ClusterId>,
    /// Severity
    pub severity: Severity,
    /// Human-readable summary
    pub message: String,
    /// Structured details in insertion order
    pub metadata: IndexMap<String, serde_json::Value>,
    /// Cluster clock when the event was recorded
    pub clock: Option<VectorClock>,
    /// Wall-clock time the entry was created
    pub timestamp: DateTime<Utc>,
}

impl EventLogEntry {
    /// Create an entry stamped now, with the kind's default severity
    #[must_use]
    pub fn new(kind: EventKind, source: impl ToString, message: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            kind,
            source: source.to_string(),
            cluster: None,
            severity: kind.default_severity(),
            message: message.into(),
            metadata: IndexMap::new(),
            clock: None,
            timestamp: Utc::now(),
        }
    }

    /// Scope the entry to a cluster
    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Override the default severity
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a vector clock snapshot
    #[must_use]
    pub fn with_clock(mut self, clock: VectorClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Attach a metadata field; insertion order is preserved
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the wall-clock timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_defaults() {
        let entry = EventLogEntry::new(EventKind::LeaderElected, "cluster_x", "elected");
        assert_eq!(entry.severity, Severity::Info);
        assert!(entry.cluster.is_none());
        assert!(entry.clock.is_none());

        let entry = EventLogEntry::new(EventKind::InvariantViolation, "cluster_x", "two holders");
        assert_eq!(entry.severity, Severity::Critical);
    }

    #[test]
    fn test_metadata_keeps_insertion_order() {
        let entry = EventLogEntry::new(EventKind::ResourceGranted, "dev_a", "granted")
            .with_meta("resource", "camera")
            .with_meta("queue", 2)
            .with_meta("algorithm", "suzuki_kasami");
        let keys: Vec<_> = entry.metadata.keys().cloned().collect();
        assert_eq!(keys, vec!["resource", "queue", "algorithm"]);
    }

    #[test]
    fn test_kind_wire_name() {
        assert_eq!(EventKind::VectorClockUpdate.as_str(), "vector_clock_update");
        let json = serde_json::to_string(&EventKind::CheckpointRestored).unwrap();
        assert_eq!(json, format!("\"{}\"", EventKind::CheckpointRestored));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Error < Severity::Critical);
    }
}
