//! Durable store backed by a single redb file.
//!
//! Records are JSON-encoded values in string-keyed tables. Checkpoint keys
//! are `<cluster>/<zero-padded sequence>` so a range scan over one cluster
//! yields checkpoints in sequence order. Each trait call runs one redb
//! transaction on the blocking pool.

use crate::record::{Checkpoint, RecoveryRecord, RecoveryStatus};
use crate::store::{CheckpointStore, MembershipStore, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dasas_core::{CheckpointId, Cluster, ClusterId, Device, DeviceId, RecoveryId};
use dasas_log::{AuditSink, EventHistory, EventLogEntry, LogError};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");
const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("checkpoint_sequences");
const RECOVERIES: TableDefinition<&str, &[u8]> = TableDefinition::new("recoveries");
const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

fn backend(err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn checkpoint_key(cluster: ClusterId, sequence: u64) -> String {
    format!("{cluster}/{sequence:020}")
}

/// Key range covering every checkpoint of one cluster
fn checkpoint_range(cluster: ClusterId) -> (String, String) {
    // '0' sorts directly after '/'
    (format!("{cluster}/"), format!("{cluster}0"))
}

fn event_key(entry: &EventLogEntry) -> String {
    let scope = entry
        .cluster
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    let millis = u64::try_from(entry.timestamp.timestamp_millis()).unwrap_or(0);
    format!("{scope}/{millis:020}/{}", entry.id)
}

/// redb-backed implementation of every store trait
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create the database file and its tables
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path.as_ref()).map_err(backend)?;
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(DEVICES).map_err(backend)?;
            txn.open_table(CLUSTERS).map_err(backend)?;
            txn.open_table(CHECKPOINTS).map_err(backend)?;
            txn.open_table(SEQUENCES).map_err(backend)?;
            txn.open_table(RECOVERIES).map_err(backend)?;
            txn.open_table(EVENTS).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        tracing::debug!(path = %path.as_ref().display(), "opened redb store");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&Database) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(backend)?
    }

    async fn get_json<T>(&self, table: TableDefinition<'static, &'static str, &'static [u8]>, key: String)
    -> StorageResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(table).map_err(backend)?;
            match table.get(key.as_str()).map_err(backend)? {
                Some(guard) => decode(guard.value()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_json(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: String,
        bytes: Vec<u8>,
    ) -> StorageResult<()> {
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut table = txn.open_table(table).map_err(backend)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
    }

    async fn scan_json<T>(&self, table: TableDefinition<'static, &'static str, &'static [u8]>)
    -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(table).map_err(backend)?;
            let mut out = Vec::new();
            for item in table.iter().map_err(backend)? {
                let (_, value) = item.map_err(backend)?;
                out.push(decode(value.value())?);
            }
            Ok(out)
        })
        .await
    }

    async fn cluster_checkpoints(&self, cluster: ClusterId) -> StorageResult<Vec<Checkpoint>> {
        self.blocking(move |db| {
            let (lo, hi) = checkpoint_range(cluster);
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(CHECKPOINTS).map_err(backend)?;
            let mut out = Vec::new();
            for item in table.range(lo.as_str()..hi.as_str()).map_err(backend)? {
                let (_, value) = item.map_err(backend)?;
                out.push(decode(value.value())?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl MembershipStore for RedbStore {
    async fn get_device(&self, id: DeviceId) -> StorageResult<Option<Device>> {
        self.get_json(DEVICES, id.to_string()).await
    }

    async fn get_cluster(&self, id: ClusterId) -> StorageResult<Option<Cluster>> {
        self.get_json(CLUSTERS, id.to_string()).await
    }

    async fn list_members(&self, cluster: ClusterId) -> StorageResult<Vec<Device>> {
        let devices: Vec<Device> = self.scan_json(DEVICES).await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.cluster == Some(cluster))
            .collect())
    }

    async fn list_clusters(&self) -> StorageResult<Vec<Cluster>> {
        let mut clusters: Vec<Cluster> = self.scan_json(CLUSTERS).await?;
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> StorageResult<()> {
        self.put_json(CLUSTERS, cluster.id.to_string(), encode(cluster)?)
            .await
    }

    async fn upsert_device(&self, device: &Device) -> StorageResult<()> {
        self.put_json(DEVICES, device.id.to_string(), encode(device)?)
            .await
    }
}

#[async_trait]
impl CheckpointStore for RedbStore {
    async fn latest_sequence(&self, cluster: ClusterId) -> StorageResult<Option<u64>> {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(SEQUENCES).map_err(backend)?;
            let key = cluster.to_string();
            Ok(table
                .get(key.as_str())
                .map_err(backend)?
                .map(|guard| guard.value()))
        })
        .await
    }

    async fn latest_checkpoint(&self, cluster: ClusterId) -> StorageResult<Option<Checkpoint>> {
        Ok(self.cluster_checkpoints(cluster).await?.pop())
    }

    async fn get_checkpoint(
        &self,
        cluster: ClusterId,
        id: CheckpointId,
    ) -> StorageResult<Option<Checkpoint>> {
        Ok(self
            .cluster_checkpoints(cluster)
            .await?
            .into_iter()
            .find(|c| c.id == id))
    }

    async fn list_checkpoints(
        &self,
        cluster: ClusterId,
        limit: usize,
    ) -> StorageResult<Vec<Checkpoint>> {
        Ok(self
            .cluster_checkpoints(cluster)
            .await?
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }

    async fn commit_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        audit: &EventLogEntry,
    ) -> StorageResult<()> {
        let cluster = checkpoint.cluster;
        let sequence = checkpoint.sequence;
        let record = encode(checkpoint)?;
        let event = encode(audit)?;
        let event_key = event_key(audit);
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(backend)?;
            {
                let mut sequences = txn.open_table(SEQUENCES).map_err(backend)?;
                let cluster_key = cluster.to_string();
                let last = sequences
                    .get(cluster_key.as_str())
                    .map_err(backend)?
                    .map_or(0, |guard| guard.value());
                if sequence <= last {
                    // dropping the transaction aborts it
                    return Err(StorageError::SequenceReused { cluster, sequence });
                }
                sequences
                    .insert(cluster_key.as_str(), sequence)
                    .map_err(backend)?;

                let mut checkpoints = txn.open_table(CHECKPOINTS).map_err(backend)?;
                checkpoints
                    .insert(checkpoint_key(cluster, sequence).as_str(), record.as_slice())
                    .map_err(backend)?;

                let mut events = txn.open_table(EVENTS).map_err(backend)?;
                events
                    .insert(event_key.as_str(), event.as_slice())
                    .map_err(backend)?;
            }
            txn.commit().map_err(backend)
        })
        .await
    }

    async fn prune_checkpoints(&self, cluster: ClusterId, keep: usize) -> StorageResult<usize> {
        self.blocking(move |db| {
            let (lo, hi) = checkpoint_range(cluster);
            let txn = db.begin_write().map_err(backend)?;
            let removed = {
                let mut table = txn.open_table(CHECKPOINTS).map_err(backend)?;
                let mut keys = Vec::new();
                for item in table.range(lo.as_str()..hi.as_str()).map_err(backend)? {
                    let (key, _) = item.map_err(backend)?;
                    keys.push(key.value().to_string());
                }
                let excess = keys.len().saturating_sub(keep);
                for key in &keys[..excess] {
                    table.remove(key.as_str()).map_err(backend)?;
                }
                excess
            };
            txn.commit().map_err(backend)?;
            Ok(removed)
        })
        .await
    }

    async fn put_recovery(&self, record: &RecoveryRecord) -> StorageResult<()> {
        self.put_json(RECOVERIES, record.id.to_string(), encode(record)?)
            .await
    }

    async fn get_recovery(&self, id: RecoveryId) -> StorageResult<Option<RecoveryRecord>> {
        self.get_json(RECOVERIES, id.to_string()).await
    }

    async fn in_progress_recovery(
        &self,
        cluster: ClusterId,
    ) -> StorageResult<Option<RecoveryRecord>> {
        let records: Vec<RecoveryRecord> = self.scan_json(RECOVERIES).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.cluster == cluster && r.status == RecoveryStatus::InProgress)
            .min_by_key(|r| r.initiated_at))
    }
}

#[async_trait]
impl AuditSink for RedbStore {
    async fn append(&self, entry: EventLogEntry) -> Result<(), LogError> {
        let unavailable = |err: StorageError| LogError::Unavailable {
            reason: err.to_string(),
        };
        let bytes = encode(&entry).map_err(unavailable)?;
        self.put_json(EVENTS, event_key(&entry), bytes)
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl EventHistory for RedbStore {
    async fn entries_for(
        &self,
        cluster: ClusterId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventLogEntry>, LogError> {
        let entries = self
            .blocking(move |db| {
                let lo = format!("{cluster}/");
                let hi = format!("{cluster}0");
                let txn = db.begin_read().map_err(backend)?;
                let table = txn.open_table(EVENTS).map_err(backend)?;
                let mut out: Vec<EventLogEntry> = Vec::new();
                for item in table.range(lo.as_str()..hi.as_str()).map_err(backend)? {
                    let (_, value) = item.map_err(backend)?;
                    out.push(decode(value.value())?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| LogError::Unavailable {
                reason: err.to_string(),
            })?;
        Ok(entries
            .into_iter()
            .filter(|e| since.is_none_or(|since| e.timestamp >= since))
            .collect())
    }
}
