//! Checkpoints and recovery markers.
//!
//! Sequence numbers are never kept in memory: every attempt re-reads the
//! highest durable sequence, so a retried write can neither skip nor repeat
//! a number. The coordinator serializes calls per cluster.

use dasas_core::{
    CheckpointId, ClusterId, CoreError, CoreResult, DeviceId, RecoveryId, RetryPolicy, Term,
    VectorClock, retry_with_backoff,
};
use dasas_log::{EventKind, EventLogEntry, Severity, emit};
use dasas_storage::{Checkpoint, RecoveryRecord, StorageError, Store};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Checkpoint and recovery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// The store failed to persist or read
    #[error("checkpoint persistence failed: {0}")]
    Persistence(#[from] StorageError),

    /// No retained checkpoint with this id
    #[error("checkpoint {id} not found in {cluster}")]
    CheckpointNotFound {
        /// Cluster searched
        cluster: ClusterId,
        /// Missing checkpoint
        id: CheckpointId,
    },

    /// No recovery with this id
    #[error("unknown recovery {0}")]
    UnknownRecovery(RecoveryId),
}

impl From<CheckpointError> for CoreError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Persistence(inner) => inner.into(),
            CheckpointError::CheckpointNotFound { id, .. } => CoreError::not_found("checkpoint", id),
            CheckpointError::UnknownRecovery(id) => CoreError::not_found("recovery", id),
        }
    }
}

/// Agreed cluster state written by scheduled checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Cluster captured
    pub cluster: ClusterId,
    /// Election term at capture time
    pub term: Term,
    /// Leader at capture time
    pub leader: Option<DeviceId>,
    /// Non-faulty members at capture time
    pub members: BTreeSet<DeviceId>,
    /// Cluster clock at capture time
    pub clock: VectorClock,
    /// Last committed agreement value
    pub agreed: Option<serde_json::Value>,
}

impl ClusterSnapshot {
    /// Serialize for a checkpoint blob
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the agreed value cannot be encoded
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a checkpoint blob
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the blob is not a snapshot
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Writes, restores and prunes one store's checkpoints
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    retention: usize,
    clock: Option<VectorClock>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("retry", &self.retry)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Create a manager
    #[must_use]
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy, retention: usize) -> Self {
        Self {
            store,
            retry,
            retention,
            clock: None,
        }
    }

    /// Copy of this manager whose audit entries carry `clock`
    #[must_use]
    pub fn stamped(&self, clock: VectorClock) -> Self {
        Self {
            clock: Some(clock),
            ..self.clone()
        }
    }

    fn entry(&self, entry: EventLogEntry) -> EventLogEntry {
        match &self.clock {
            Some(clock) => entry.with_clock(clock.clone()),
            None => entry,
        }
    }

    /// Commit `data` as the cluster's next checkpoint, then prune.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` once the retry policy is exhausted
    pub async fn create(&self, cluster: ClusterId, data: Vec<u8>) -> CoreResult<Checkpoint> {
        let store = &self.store;
        let data = &data;
        let this = self;
        let checkpoint = retry_with_backoff(self.retry, "create checkpoint", || async move {
            let sequence = store
                .latest_sequence(cluster)
                .await
                .map_err(CheckpointError::from)?
                .unwrap_or(0)
                + 1;
            let checkpoint = Checkpoint::new(cluster, sequence, data.clone());
            let audit = this.entry(
                EventLogEntry::new(
                    EventKind::CheckpointCreated,
                    cluster,
                    format!("checkpoint {sequence} created"),
                )
                .with_cluster(cluster)
                .with_meta("checkpoint", checkpoint.id.to_string())
                .with_meta("sequence", sequence)
                .with_meta("digest", checkpoint.digest.to_hex()),
            );
            store
                .commit_checkpoint(&checkpoint, &audit)
                .await
                .map_err(CheckpointError::from)?;
            Ok::<_, CoreError>(checkpoint)
        })
        .await?;

        tracing::info!(
            cluster = %cluster,
            sequence = checkpoint.sequence,
            bytes = checkpoint.data.len(),
            "checkpoint committed"
        );

        match self.store.prune_checkpoints(cluster, self.retention).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(cluster = %cluster, pruned, "superseded checkpoints pruned"),
            Err(err) => tracing::warn!(cluster = %cluster, error = %err, "checkpoint pruning failed"),
        }
        Ok(checkpoint)
    }

    /// Load a checkpoint for restoration; the newest one when `id` is `None`.
    ///
    /// Live membership is left alone.
    ///
    /// # Errors
    ///
    /// `NotFound` if the checkpoint is absent, `InvariantViolation` if its
    /// digest no longer matches its data
    pub async fn restore(&self, cluster: ClusterId, id: Option<CheckpointId>) -> CoreResult<Checkpoint> {
        let found = match id {
            Some(id) => self
                .store
                .get_checkpoint(cluster, id)
                .await
                .map_err(CheckpointError::from)?
                .ok_or(CheckpointError::CheckpointNotFound { cluster, id })?,
            None => self
                .store
                .latest_checkpoint(cluster)
                .await
                .map_err(CheckpointError::from)?
                .ok_or_else(|| CoreError::not_found("checkpoint for cluster", cluster))?,
        };

        if !found.verify() {
            return Err(CoreError::invariant(format!(
                "checkpoint {} of {cluster} fails its digest",
                found.sequence
            )));
        }

        tracing::info!(cluster = %cluster, sequence = found.sequence, "checkpoint restored");
        emit(
            self.store.as_ref(),
            self.entry(
                EventLogEntry::new(
                    EventKind::CheckpointRestored,
                    cluster,
                    format!("restored checkpoint {}", found.sequence),
                )
                .with_cluster(cluster)
                .with_meta("checkpoint", found.id.to_string())
                .with_meta("sequence", found.sequence),
            ),
        )
        .await;
        Ok(found)
    }

    /// Retained checkpoints, newest first
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the store cannot be read
    pub async fn list(&self, cluster: ClusterId, limit: usize) -> CoreResult<Vec<Checkpoint>> {
        Ok(self
            .store
            .list_checkpoints(cluster, limit)
            .await
            .map_err(CheckpointError::from)?)
    }

    /// Highest durable sequence
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the store cannot be read
    pub async fn latest_sequence(&self, cluster: ClusterId) -> CoreResult<Option<u64>> {
        Ok(self
            .store
            .latest_sequence(cluster)
            .await
            .map_err(CheckpointError::from)?)
    }

    /// Record intent to recover.
    ///
    /// If the cluster already has a recovery in progress, that record is
    /// returned instead of starting a second one.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the marker cannot be written
    pub async fn initiate_recovery(&self, cluster: ClusterId, reason: &str) -> CoreResult<RecoveryRecord> {
        if let Some(existing) = self
            .store
            .in_progress_recovery(cluster)
            .await
            .map_err(CheckpointError::from)?
        {
            tracing::debug!(cluster = %cluster, recovery = %existing.id, "recovery already in progress");
            return Ok(existing);
        }

        let record = RecoveryRecord::initiate(cluster, reason);
        self.put_recovery(&record).await?;
        tracing::info!(cluster = %cluster, recovery = %record.id, reason, "recovery initiated");
        emit(
            self.store.as_ref(),
            self.entry(
                EventLogEntry::new(EventKind::RecoveryInitiated, cluster, reason)
                    .with_cluster(cluster)
                    .with_severity(Severity::Warning)
                    .with_meta("recovery", record.id.to_string()),
            ),
        )
        .await;
        Ok(record)
    }

    /// Record the terminal outcome; completing twice returns the first outcome
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown recovery, `Storage` if the marker cannot be written
    pub async fn complete_recovery(
        &self,
        id: RecoveryId,
        success: bool,
        details: &str,
    ) -> CoreResult<RecoveryRecord> {
        let record = self
            .store
            .get_recovery(id)
            .await
            .map_err(CheckpointError::from)?
            .ok_or(CheckpointError::UnknownRecovery(id))?;
        if record.status.is_terminal() {
            return Ok(record);
        }

        let record = record.complete(success, details);
        self.put_recovery(&record).await?;
        tracing::info!(cluster = %record.cluster, recovery = %id, success, "recovery completed");
        let severity = if success { Severity::Info } else { Severity::Error };
        emit(
            self.store.as_ref(),
            self.entry(
                EventLogEntry::new(EventKind::RecoveryCompleted, record.cluster, details)
                    .with_cluster(record.cluster)
                    .with_severity(severity)
                    .with_meta("recovery", id.to_string())
                    .with_meta("success", success),
            ),
        )
        .await;
        Ok(record)
    }

    /// Look up a recovery
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown recovery
    pub async fn recovery(&self, id: RecoveryId) -> CoreResult<RecoveryRecord> {
        Ok(self
            .store
            .get_recovery(id)
            .await
            .map_err(CheckpointError::from)?
            .ok_or(CheckpointError::UnknownRecovery(id))?)
    }

    async fn put_recovery(&self, record: &RecoveryRecord) -> CoreResult<()> {
        let store = &self.store;
        retry_with_backoff(self.retry, "write recovery marker", || async move {
            store
                .put_recovery(record)
                .await
                .map_err(|err| CoreError::from(CheckpointError::from(err)))
        })
        .await
    }
}
