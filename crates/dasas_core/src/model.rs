//! Device and cluster records held by the membership store.
//!
//! Leader and membership references are plain ids looked up through the
//! store; neither record owns the other.

use crate::{ClusterId, DeviceId, Term};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Device liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Sending heartbeats
    Online,
    /// Marked offline; devices are never hard-deleted
    Offline,
}

/// A registered Android device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Liveness status
    pub status: DeviceStatus,
    /// Last heartbeat received
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Owning cluster, if any
    pub cluster: Option<ClusterId>,
    /// Advertised capabilities
    pub capabilities: BTreeSet<String>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

impl Device {
    /// Create a new, offline device with no cluster
    #[must_use]
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: DeviceStatus::Offline,
            last_heartbeat: None,
            cluster: None,
            capabilities: BTreeSet::new(),
            registered_at: Utc::now(),
        }
    }

    /// Set capabilities
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Stamp a heartbeat, marking the device online
    #[must_use]
    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self.status = DeviceStatus::Online;
        self
    }

    /// Assign to a cluster
    #[must_use]
    pub fn in_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Check if the device is online
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

/// Cluster lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Created, no leader elected yet
    Forming,
    /// Leader elected
    Active,
    /// Leader lost with no electable member
    Degraded,
    /// Membership reached zero or dissolved by an admin
    Dissolved,
}

/// Mutual exclusion parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutexSettings {
    /// Algorithm name, informational
    pub algorithm: String,
    /// Grace period for a queued request before it fails
    pub request_timeout_ms: u64,
}

impl Default for MutexSettings {
    fn default() -> Self {
        Self {
            algorithm: "suzuki_kasami".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

/// Vector clock retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorClockSettings {
    /// Entries of departed devices idle this long are pruned
    pub retention_ms: u64,
    /// Hard bound on entries per cluster clock
    pub max_entries: usize,
}

impl Default for VectorClockSettings {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1_000,
            max_entries: 10_000,
        }
    }
}

/// Per-cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Election timeout in milliseconds
    pub election_timeout_ms: u64,
    /// Expected heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Mutual exclusion parameters
    pub mutual_exclusion: MutexSettings,
    /// Vector clock retention
    pub vector_clock: VectorClockSettings,
}

impl ClusterSettings {
    /// Set election timeout
    #[must_use]
    pub fn with_election_timeout(mut self, timeout_ms: u64) -> Self {
        self.election_timeout_ms = timeout_ms;
        self
    }

    /// Set mutual exclusion request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.mutual_exclusion.request_timeout_ms = timeout_ms;
        self
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            mutual_exclusion: MutexSettings::default(),
            vector_clock: VectorClockSettings::default(),
        }
    }
}

/// A cluster of devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster id
    pub id: ClusterId,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub state: ClusterState,
    /// Current leader; a weak reference by id
    pub leader: Option<DeviceId>,
    /// Term in which `leader` was elected
    pub term: Term,
    /// Cached member count
    pub member_count: usize,
    /// Configuration
    pub settings: ClusterSettings,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last coordination activity
    pub last_activity: DateTime<Utc>,
}

impl Cluster {
    /// Create a forming cluster
    #[must_use]
    pub fn new(id: ClusterId, name: impl Into<String>, settings: ClusterSettings) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            state: ClusterState::Forming,
            leader: None,
            term: Term::zero(),
            member_count: 0,
            settings,
            created_at: now,
            last_activity: now,
        }
    }

    /// Check whether the cluster has been dissolved
    #[must_use]
    pub fn is_dissolved(&self) -> bool {
        self.state == ClusterState::Dissolved
    }

    /// Record coordination activity
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_new_is_offline() {
        let device = Device::new(DeviceId::new(), "pixel");
        assert!(!device.is_online());
        assert!(device.cluster.is_none());
    }

    #[test]
    fn test_device_builders() {
        let cluster = ClusterId::new();
        let device = Device::new(DeviceId::new(), "pixel")
            .with_capabilities(["ocr", "camera"])
            .with_heartbeat(Utc::now())
            .in_cluster(cluster);
        assert!(device.is_online());
        assert_eq!(device.cluster, Some(cluster));
        assert!(device.capabilities.contains("ocr"));
    }

    #[test]
    fn test_cluster_new_is_forming() {
        let cluster = Cluster::new(ClusterId::new(), "lab", ClusterSettings::default());
        assert_eq!(cluster.state, ClusterState::Forming);
        assert_eq!(cluster.leader, None);
        assert_eq!(cluster.term, Term::zero());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ClusterSettings::default().with_request_timeout(250);
        assert_eq!(settings.election_timeout_ms, 5_000);
        assert_eq!(settings.mutual_exclusion.request_timeout_ms, 250);
        assert_eq!(settings.vector_clock.max_entries, 10_000);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ClusterState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
