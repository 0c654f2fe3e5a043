//! Member health classification.

use crate::config::HealthConfig;
use chrono::{DateTime, Utc};
use dasas_core::{Device, DeviceId, DeviceStatus, elapsed_ms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Health of one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heartbeat age below the soft timeout
    Healthy,
    /// Heartbeat age between the soft and hard timeouts
    Suspect,
    /// Beyond the hard timeout, offline, or caught equivocating
    Faulty,
}

/// Classify a member.
///
/// Pure: depends only on the device record, the current time and whether
/// the device was caught sending contradictory votes. A device that never
/// sent a heartbeat is aged from its registration.
#[must_use]
pub fn classify(
    device: &Device,
    now: DateTime<Utc>,
    config: &HealthConfig,
    contradicted: bool,
) -> HealthStatus {
    if contradicted || device.status == DeviceStatus::Offline {
        return HealthStatus::Faulty;
    }
    let age = elapsed_ms(device.last_heartbeat.unwrap_or(device.registered_at), now);
    if age < config.soft_timeout_ms {
        HealthStatus::Healthy
    } else if age < config.hard_timeout_ms {
        HealthStatus::Suspect
    } else {
        HealthStatus::Faulty
    }
}

/// Classification of every member of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Heartbeat within the soft timeout
    pub healthy: BTreeSet<DeviceId>,
    /// Between the soft and hard timeouts
    pub suspect: BTreeSet<DeviceId>,
    /// Excluded from votes and locks
    pub faulty: BTreeSet<DeviceId>,
}

impl HealthReport {
    /// Classify `members`, treating devices in `contradicted` as faulty
    #[must_use]
    pub fn build(
        members: &[Device],
        now: DateTime<Utc>,
        config: &HealthConfig,
        contradicted: &BTreeSet<DeviceId>,
    ) -> Self {
        let mut report = Self::default();
        for device in members {
            let bucket = match classify(device, now, config, contradicted.contains(&device.id)) {
                HealthStatus::Healthy => &mut report.healthy,
                HealthStatus::Suspect => &mut report.suspect,
                HealthStatus::Faulty => &mut report.faulty,
            };
            bucket.insert(device.id);
        }
        report
    }

    /// Members allowed to stand for election and vote
    #[must_use]
    pub fn eligible(&self) -> BTreeSet<DeviceId> {
        self.healthy.union(&self.suspect).copied().collect()
    }

    /// Status of one member, if it is in the report
    #[must_use]
    pub fn status_of(&self, device: &DeviceId) -> Option<HealthStatus> {
        if self.healthy.contains(device) {
            Some(HealthStatus::Healthy)
        } else if self.suspect.contains(device) {
            Some(HealthStatus::Suspect)
        } else if self.faulty.contains(device) {
            Some(HealthStatus::Faulty)
        } else {
            None
        }
    }
}
