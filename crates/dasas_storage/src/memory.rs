//! In-memory store.
//!
//! Used by tests and the demo. Write failures can be injected to exercise
//! retry paths.

use crate::record::{Checkpoint, RecoveryRecord, RecoveryStatus};
use crate::store::{CheckpointStore, MembershipStore, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dasas_core::{CheckpointId, Cluster, ClusterId, Device, DeviceId, RecoveryId};
use dasas_log::{AuditSink, EventHistory, EventLogEntry, LogError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    clusters: HashMap<ClusterId, Cluster>,
    checkpoints: HashMap<ClusterId, BTreeMap<u64, Checkpoint>>,
    sequences: HashMap<ClusterId, u64>,
    recoveries: HashMap<RecoveryId, RecoveryRecord>,
    events: Vec<EventLogEntry>,
}

/// In-memory implementation of every store trait
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    failing_writes: Arc<AtomicUsize>,
    failing_cluster_writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` membership, checkpoint or recovery writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` cluster record writes fail; other writes succeed
    pub fn fail_next_cluster_writes(&self, count: usize) {
        self.failing_cluster_writes.store(count, Ordering::SeqCst);
    }

    /// Every audit entry in append order
    pub async fn events(&self) -> Vec<EventLogEntry> {
        self.inner.read().await.events.clone()
    }

    fn check_write(&self) -> StorageResult<()> {
        Self::take_failure(&self.failing_writes)
    }

    fn take_failure(counter: &AtomicUsize) -> StorageResult<()> {
        let injected = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StorageError::Backend("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get_device(&self, id: DeviceId) -> StorageResult<Option<Device>> {
        Ok(self.inner.read().await.devices.get(&id).cloned())
    }

    async fn get_cluster(&self, id: ClusterId) -> StorageResult<Option<Cluster>> {
        Ok(self.inner.read().await.clusters.get(&id).cloned())
    }

    async fn list_members(&self, cluster: ClusterId) -> StorageResult<Vec<Device>> {
        let inner = self.inner.read().await;
        let mut members: Vec<_> = inner
            .devices
            .values()
            .filter(|d| d.cluster == Some(cluster))
            .cloned()
            .collect();
        members.sort_by_key(|d| d.id);
        Ok(members)
    }

    async fn list_clusters(&self) -> StorageResult<Vec<Cluster>> {
        let inner = self.inner.read().await;
        let mut clusters: Vec<_> = inner.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> StorageResult<()> {
        self.check_write()?;
        Self::take_failure(&self.failing_cluster_writes)?;
        self.inner
            .write()
            .await
            .clusters
            .insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        self.check_write()?;
        self.inner
            .write()
            .await
            .devices
            .insert(device.id, device.clone());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn latest_sequence(&self, cluster: ClusterId) -> StorageResult<Option<u64>> {
        Ok(self.inner.read().await.sequences.get(&cluster).copied())
    }

    async fn latest_checkpoint(&self, cluster: ClusterId) -> StorageResult<Option<Checkpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&cluster)
            .and_then(|by_seq| by_seq.values().next_back().cloned()))
    }

    async fn get_checkpoint(
        &self,
        cluster: ClusterId,
        id: CheckpointId,
    ) -> StorageResult<Option<Checkpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&cluster)
            .and_then(|by_seq| by_seq.values().find(|c| c.id == id).cloned()))
    }

    async fn list_checkpoints(
        &self,
        cluster: ClusterId,
        limit: usize,
    ) -> StorageResult<Vec<Checkpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&cluster)
            .map(|by_seq| by_seq.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        audit: &EventLogEntry,
    ) -> StorageResult<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let last = inner.sequences.get(&checkpoint.cluster).copied().unwrap_or(0);
        if checkpoint.sequence <= last {
            return Err(StorageError::SequenceReused {
                cluster: checkpoint.cluster,
                sequence: checkpoint.sequence,
            });
        }
        inner
            .checkpoints
            .entry(checkpoint.cluster)
            .or_default()
            .insert(checkpoint.sequence, checkpoint.clone());
        inner.sequences.insert(checkpoint.cluster, checkpoint.sequence);
        inner.events.push(audit.clone());
        Ok(())
    }

    async fn prune_checkpoints(&self, cluster: ClusterId, keep: usize) -> StorageResult<usize> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let Some(by_seq) = inner.checkpoints.get_mut(&cluster) else {
            return Ok(0);
        };
        let excess = by_seq.len().saturating_sub(keep);
        let doomed: Vec<u64> = by_seq.keys().take(excess).copied().collect();
        for sequence in &doomed {
            by_seq.remove(sequence);
        }
        Ok(doomed.len())
    }

    async fn put_recovery(&self, record: &RecoveryRecord) -> StorageResult<()> {
        self.check_write()?;
        self.inner
            .write()
            .await
            .recoveries
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_recovery(&self, id: RecoveryId) -> StorageResult<Option<RecoveryRecord>> {
        Ok(self.inner.read().await.recoveries.get(&id).cloned())
    }

    async fn in_progress_recovery(
        &self,
        cluster: ClusterId,
    ) -> StorageResult<Option<RecoveryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .recoveries
            .values()
            .filter(|r| r.cluster == cluster && r.status == RecoveryStatus::InProgress)
            .min_by_key(|r| r.initiated_at)
            .cloned())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: EventLogEntry) -> Result<(), LogError> {
        self.inner.write().await.events.push(entry);
        Ok(())
    }
}

#[async_trait]
impl EventHistory for MemoryStore {
    async fn entries_for(
        &self,
        cluster: ClusterId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventLogEntry>, LogError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.cluster == Some(cluster))
            .filter(|e| since.is_none_or(|since| e.timestamp >= since))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dasas_core::ClusterSettings;
    use dasas_log::EventKind;

    fn audit(cluster: ClusterId) -> EventLogEntry {
        EventLogEntry::new(EventKind::CheckpointCreated, cluster, "checkpoint").with_cluster(cluster)
    }

    #[tokio::test]
    async fn test_membership_roundtrip() {
        let store = MemoryStore::new();
        let cluster = Cluster::new(ClusterId::new(), "lab", ClusterSettings::default());
        store.upsert_cluster(&cluster).await.unwrap();

        let a = Device::new(DeviceId::new(), "a").in_cluster(cluster.id);
        let b = Device::new(DeviceId::new(), "b");
        store.upsert_device(&a).await.unwrap();
        store.upsert_device(&b).await.unwrap();

        assert_eq!(store.get_cluster(cluster.id).await.unwrap(), Some(cluster.clone()));
        let members = store.list_members(cluster.id).await.unwrap();
        assert_eq!(members, vec![a]);
        assert_eq!(store.list_clusters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let cluster = ClusterId::new();
        store.fail_next_writes(1);

        let checkpoint = Checkpoint::new(cluster, 1, b"s1".to_vec());
        assert!(store.commit_checkpoint(&checkpoint, &audit(cluster)).await.is_err());
        assert_eq!(store.latest_sequence(cluster).await.unwrap(), None);
        assert!(store.events().await.is_empty());

        store.commit_checkpoint(&checkpoint, &audit(cluster)).await.unwrap();
        assert_eq!(store.latest_sequence(cluster).await.unwrap(), Some(1));
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_write_failure_spares_devices() {
        let store = MemoryStore::new();
        let cluster = Cluster::new(ClusterId::new(), "lab", ClusterSettings::default());
        store.fail_next_cluster_writes(1);
        assert!(store.upsert_cluster(&cluster).await.is_err());
        store
            .upsert_device(&Device::new(DeviceId::new(), "cam"))
            .await
            .unwrap();
        store.upsert_cluster(&cluster).await.unwrap();
        assert_eq!(store.get_cluster(cluster.id).await.unwrap(), Some(cluster));
    }

    #[tokio::test]
    async fn test_sequence_never_reused() {
        let store = MemoryStore::new();
        let cluster = ClusterId::new();
        store
            .commit_checkpoint(&Checkpoint::new(cluster, 1, vec![1]), &audit(cluster))
            .await
            .unwrap();
        let err = store
            .commit_checkpoint(&Checkpoint::new(cluster, 1, vec![2]), &audit(cluster))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SequenceReused { sequence: 1, .. }));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_sequence() {
        let store = MemoryStore::new();
        let cluster = ClusterId::new();
        for seq in 1..=5 {
            store
                .commit_checkpoint(&Checkpoint::new(cluster, seq, vec![seq as u8]), &audit(cluster))
                .await
                .unwrap();
        }
        assert_eq!(store.prune_checkpoints(cluster, 2).await.unwrap(), 3);
        let listed: Vec<_> = store
            .list_checkpoints(cluster, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(listed, vec![5, 4]);
        assert_eq!(store.latest_sequence(cluster).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_in_progress_recovery() {
        let store = MemoryStore::new();
        let cluster = ClusterId::new();
        assert!(store.in_progress_recovery(cluster).await.unwrap().is_none());

        let record = RecoveryRecord::initiate(cluster, "partition");
        store.put_recovery(&record).await.unwrap();
        assert_eq!(
            store.in_progress_recovery(cluster).await.unwrap().map(|r| r.id),
            Some(record.id)
        );

        store.put_recovery(&record.complete(true, "restored")).await.unwrap();
        assert!(store.in_progress_recovery(cluster).await.unwrap().is_none());
    }
}
