//! Vector clock service.
//!
//! Each cluster coordinator owns one authoritative clock. Every read hands
//! out a copy; nothing outside the coordinator can mutate the clock.

use chrono::{DateTime, Utc};
use dasas_core::{DeviceId, VectorClock, VectorClockSettings, elapsed_ms};
use std::collections::{BTreeSet, HashMap};

/// Authoritative per-cluster clock plus pruning bookkeeping
#[derive(Debug, Clone)]
pub struct ClockService {
    clock: VectorClock,
    advanced_at: HashMap<DeviceId, DateTime<Utc>>,
    settings: VectorClockSettings,
}

impl ClockService {
    /// Create an empty clock
    #[must_use]
    pub fn new(settings: VectorClockSettings) -> Self {
        Self {
            clock: VectorClock::new(),
            advanced_at: HashMap::new(),
            settings,
        }
    }

    /// Advance `device`'s own entry for a new event and return a snapshot
    pub fn record(&mut self, device: DeviceId, now: DateTime<Utc>) -> VectorClock {
        let counter = self.clock.tick(device);
        self.advanced_at.insert(device, now);
        tracing::trace!(device = %device, counter, "clock advanced");
        self.clock.clone()
    }

    /// Merge a clock received from `sender`.
    ///
    /// Every entry takes the pointwise maximum. The sender's own entry is
    /// authoritative for that device but can never move backwards; a lower
    /// value means a stale or replayed message and is ignored.
    pub fn merge(
        &mut self,
        sender: DeviceId,
        incoming: &VectorClock,
        now: DateTime<Utc>,
    ) -> VectorClock {
        let before = self.clock.clone();
        let own = incoming.get(&sender);
        if own < before.get(&sender) {
            tracing::warn!(
                device = %sender,
                incoming = own,
                known = before.get(&sender),
                "ignoring regressed clock entry"
            );
        }
        self.clock.merge(incoming);
        for (device, counter) in self.clock.iter() {
            if *counter > before.get(device) {
                self.advanced_at.insert(*device, now);
            }
        }
        self.clock.clone()
    }

    /// Copy of the current clock
    #[must_use]
    pub fn snapshot(&self) -> VectorClock {
        self.clock.clone()
    }

    /// Drop entries of departed devices.
    ///
    /// Non-members idle past the retention window are always removed. If the
    /// clock is still above `max_entries`, the longest-idle non-members go
    /// next. Member entries are never pruned. Returns the pruned devices.
    pub fn prune(&mut self, members: &BTreeSet<DeviceId>, now: DateTime<Utc>) -> Vec<DeviceId> {
        let idle_since = |advanced_at: &HashMap<DeviceId, DateTime<Utc>>, device: &DeviceId| {
            advanced_at.get(device).copied().unwrap_or(DateTime::<Utc>::MIN_UTC)
        };

        let mut departed: Vec<(DateTime<Utc>, DeviceId)> = self
            .clock
            .iter()
            .map(|(device, _)| *device)
            .filter(|device| !members.contains(device))
            .map(|device| (idle_since(&self.advanced_at, &device), device))
            .collect();
        departed.sort();

        let mut pruned = Vec::new();
        let mut remaining = self.clock.len();
        for (last, device) in departed {
            let expired = elapsed_ms(last, now) >= self.settings.retention_ms;
            let over_limit = remaining > self.settings.max_entries;
            if expired || over_limit {
                self.clock.remove(&device);
                self.advanced_at.remove(&device);
                remaining -= 1;
                pruned.push(device);
            }
        }
        if remaining > self.settings.max_entries {
            tracing::warn!(
                entries = remaining,
                max = self.settings.max_entries,
                "clock above bound with only member entries left"
            );
        }
        pruned
    }

    /// Replace the retention settings
    pub fn set_settings(&mut self, settings: VectorClockSettings) {
        self.settings = settings;
    }

    /// Whether the clock has outgrown its bound
    #[must_use]
    pub fn over_limit(&self) -> bool {
        self.clock.len() > self.settings.max_entries
    }
}
