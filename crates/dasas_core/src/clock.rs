//! Vector clocks.
//!
//! A clock maps device ids to monotonically increasing counters. Clocks are
//! plain values: callers get copies, never references into the cluster's
//! authoritative clock.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relationship between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    /// Left happened before right
    Before,
    /// Right happened before left
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates
    Concurrent,
}

/// Per-cluster vector clock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create an empty clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device (zero when absent)
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.entries.get(device).copied().unwrap_or(0)
    }

    /// Increment a device's counter and return the new value
    pub fn tick(&mut self, device: DeviceId) -> u64 {
        let counter = self.entries.entry(device).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`
    pub fn merge(&mut self, other: &Self) {
        for (device, &counter) in &other.entries {
            let entry = self.entries.entry(*device).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Compare two clocks
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for device in self.entries.keys().chain(other.entries.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }
        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True iff every entry of `self` is <= `other` and at least one is strictly less
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Sum of all counters; strictly increases along any causal chain
    #[must_use]
    pub fn weight(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Drop an entry
    pub fn remove(&mut self, device: &DeviceId) -> Option<u64> {
        self.entries.remove(device)
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&DeviceId) -> bool) {
        self.entries.retain(|device, _| keep(device));
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the clock has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in device order
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.entries.iter()
    }
}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (DeviceId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn devices() -> [DeviceId; 3] {
        [
            DeviceId::from_name("a"),
            DeviceId::from_name("b"),
            DeviceId::from_name("c"),
        ]
    }

    #[test]
    fn test_tick_and_compare() {
        let [a, b, _] = devices();
        let mut x = VectorClock::new();
        x.tick(a);
        let mut y = x.clone();
        y.tick(b);
        assert_eq!(x.compare(&y), CausalOrder::Before);
        assert_eq!(y.compare(&x), CausalOrder::After);
        assert!(x.happens_before(&y));
        assert!(!y.happens_before(&x));
        assert_eq!(x.compare(&x.clone()), CausalOrder::Equal);
    }

    #[test]
    fn test_concurrent() {
        let [a, b, _] = devices();
        let mut x = VectorClock::new();
        let mut y = VectorClock::new();
        x.tick(a);
        y.tick(b);
        assert_eq!(x.compare(&y), CausalOrder::Concurrent);
        assert!(!x.happens_before(&y));
        assert!(!y.happens_before(&x));
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let [a, b, c] = devices();
        let mut x: VectorClock = [(a, 3), (b, 1)].into_iter().collect();
        let y: VectorClock = [(a, 1), (b, 4), (c, 2)].into_iter().collect();
        x.merge(&y);
        assert_eq!((x.get(&a), x.get(&b), x.get(&c)), (3, 4, 2));
    }

    #[test]
    fn test_missing_entries_are_zero() {
        let [a, _, _] = devices();
        let x: VectorClock = [(a, 0)].into_iter().collect();
        assert_eq!(x.compare(&VectorClock::new()), CausalOrder::Equal);
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::vec(0u64..5, 3).prop_map(|counters| {
            devices().into_iter().zip(counters).collect()
        })
    }

    proptest::proptest! {
        #[test]
        fn prop_happens_before_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
            prop_assert!(!(a.happens_before(&b) && b.happens_before(&a)));
        }

        #[test]
        fn prop_merge_dominates_inputs(a in arb_clock(), b in arb_clock()) {
            let mut merged = a.clone();
            merged.merge(&b);
            prop_assert!(matches!(a.compare(&merged), CausalOrder::Before | CausalOrder::Equal));
            prop_assert!(matches!(b.compare(&merged), CausalOrder::Before | CausalOrder::Equal));
        }

        #[test]
        fn prop_weight_respects_causality(a in arb_clock(), b in arb_clock()) {
            if a.happens_before(&b) {
                prop_assert!(a.weight() < b.weight());
            }
        }
    }
}
