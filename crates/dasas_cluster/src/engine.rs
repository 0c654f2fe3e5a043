//! Coordination engine.
//!
//! The entry point for every exposed operation. Cluster-scoped calls are
//! forwarded to that cluster's coordinator, which is started on first use;
//! the registry lock is only held for lookups, never across a call.

use crate::agreement::{Outcome, Proposal, Vote, VoteEffect};
use crate::config::EngineConfig;
use crate::coordinator::{
    self, Acquisition, ClusterHandle, ClusterStatus, Command, DeviceLocks, EngineContext, Submitted,
};
use crate::election::LeaderAnnouncement;
use crate::health::HealthReport;
use crate::mutex::{MutexError, MutexOutcome};
use crate::network::PeerNetwork;
use chrono::{DateTime, Utc};
use dasas_core::{
    CausalOrder, CheckpointId, Cluster, ClusterId, ClusterSettings, CoreError, CoreResult, Device,
    DeviceId, DeviceStatus, RecoveryId, Term, VectorClock,
};
use dasas_log::{CausalHistory, EventKind, EventLogEntry, Severity, emit};
use dasas_storage::{Checkpoint, RecoveryRecord, Store};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Cluster coordination and fault-tolerance engine
#[derive(Clone)]
pub struct CoordinationEngine {
    ctx: EngineContext,
    clusters: Arc<RwLock<HashMap<ClusterId, ClusterHandle>>>,
    checkpoints: crate::checkpoint::CheckpointManager,
}

impl std::fmt::Debug for CoordinationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationEngine")
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

impl CoordinationEngine {
    /// Create an engine over a store and a peer network
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the configuration is inconsistent
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<dyn PeerNetwork>,
        config: EngineConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        let checkpoints = crate::checkpoint::CheckpointManager::new(
            Arc::clone(&store),
            config.storage_retry,
            config.checkpoint.retention_count,
        );
        Ok(Self {
            ctx: EngineContext {
                store,
                network,
                config: Arc::new(config),
                locks: DeviceLocks::default(),
            },
            clusters: Arc::new(RwLock::new(HashMap::new())),
            checkpoints,
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    async fn handle(&self, id: ClusterId) -> CoreResult<ClusterHandle> {
        if let Some(handle) = self.clusters.read().await.get(&id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }

        let cluster = self
            .ctx
            .store
            .get_cluster(id)
            .await?
            .ok_or_else(|| CoreError::not_found("cluster", id))?;
        if cluster.is_dissolved() {
            self.clusters.write().await.remove(&id);
            return Err(CoreError::conflict(format!("cluster {id} is dissolved")));
        }
        let members: BTreeSet<DeviceId> = self
            .ctx
            .store
            .list_members(id)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();

        let mut clusters = self.clusters.write().await;
        if let Some(handle) = clusters.get(&id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }
        tracing::debug!(cluster = %id, "starting coordinator");
        let handle = coordinator::spawn(self.ctx.clone(), cluster, members);
        clusters.insert(id, handle.clone());
        Ok(handle)
    }

    // clusters

    /// Create a cluster in the `forming` state
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the cluster cannot be persisted
    pub async fn create_cluster(
        &self,
        name: &str,
        settings: Option<ClusterSettings>,
    ) -> CoreResult<Cluster> {
        let settings = settings.unwrap_or_else(|| self.ctx.config.cluster_defaults.clone());
        let cluster = Cluster::new(ClusterId::new(), name, settings);
        self.ctx.write_cluster(&cluster).await?;
        tracing::info!(cluster = %cluster.id, name, "cluster created");
        emit(
            self.ctx.store.as_ref(),
            EventLogEntry::new(EventKind::ClusterCreated, cluster.id, format!("cluster {name} created"))
                .with_cluster(cluster.id),
        )
        .await;

        let handle = coordinator::spawn(self.ctx.clone(), cluster.clone(), BTreeSet::new());
        self.clusters.write().await.insert(cluster.id, handle);
        Ok(cluster)
    }

    /// Look up a cluster record
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown cluster
    pub async fn get_cluster(&self, id: ClusterId) -> CoreResult<Cluster> {
        self.ctx
            .store
            .get_cluster(id)
            .await?
            .ok_or_else(|| CoreError::not_found("cluster", id))
    }

    /// Clusters that have not been dissolved
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the store cannot be read
    pub async fn active_clusters(&self) -> CoreResult<Vec<Cluster>> {
        let mut clusters = self.ctx.store.list_clusters().await?;
        clusters.retain(|c| !c.is_dissolved());
        Ok(clusters)
    }

    /// Clusters whose name or id contains `query`, ignoring case, sorted by name
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the store cannot be read
    pub async fn search_clusters(&self, query: &str) -> CoreResult<Vec<Cluster>> {
        let query = query.trim().to_lowercase();
        let mut clusters = self.ctx.store.list_clusters().await?;
        clusters.retain(|c| {
            c.name.to_lowercase().contains(&query) || c.id.to_string().to_lowercase().contains(&query)
        });
        clusters.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(clusters)
    }

    /// Rename a cluster and/or replace its settings
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name or zero election timeout, `NotFound`
    /// for an unknown cluster, `Conflict` if dissolved
    pub async fn update_cluster(
        &self,
        id: ClusterId,
        name: Option<&str>,
        settings: Option<ClusterSettings>,
    ) -> CoreResult<Cluster> {
        let name = name.map(str::to_string);
        self.handle(id)
            .await?
            .call(|reply| Command::Update {
                name,
                settings,
                reply,
            })
            .await
    }

    /// Detach every member and dissolve the cluster
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster, `Conflict` if already dissolved
    pub async fn dissolve_cluster(&self, id: ClusterId) -> CoreResult<Cluster> {
        let handle = self.handle(id).await?;
        let cluster = handle.call(|reply| Command::Dissolve { reply }).await?;
        self.clusters.write().await.remove(&id);
        Ok(cluster)
    }

    /// Status, health and coordination state of a cluster
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster, `Conflict` if dissolved
    pub async fn cluster_status(&self, id: ClusterId) -> CoreResult<ClusterStatus> {
        self.handle(id).await?.call(|reply| Command::Status { reply }).await
    }

    // devices and membership

    /// Register a device; it starts online with a fresh heartbeat
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the device cannot be persisted
    pub async fn register_device<I, S>(&self, name: &str, capabilities: I) -> CoreResult<Device>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let device = Device::new(DeviceId::new(), name)
            .with_capabilities(capabilities)
            .with_heartbeat(Utc::now());
        self.ctx.write_device(&device).await?;
        tracing::info!(device = %device.id, name, "device registered");
        emit(
            self.ctx.store.as_ref(),
            EventLogEntry::new(EventKind::DeviceRegistered, device.id, format!("{name} registered"))
                .with_meta("capabilities", device.capabilities.iter().cloned().collect::<Vec<_>>()),
        )
        .await;
        Ok(device)
    }

    /// Look up a device record
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown device
    pub async fn get_device(&self, id: DeviceId) -> CoreResult<Device> {
        self.ctx
            .store
            .get_device(id)
            .await?
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    /// Record a heartbeat; marks the device online
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown device, `Storage` on write failure
    pub async fn heartbeat(&self, device: DeviceId) -> CoreResult<Device> {
        self.ctx
            .update_device(device, |record| {
                record.status = DeviceStatus::Online;
                record.last_heartbeat = Some(Utc::now());
                Ok(())
            })
            .await
    }

    /// Mark a device offline; its cluster reclaims its tokens and re-elects
    /// if it was the leader
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown device, `Storage` on write failure
    pub async fn mark_offline(&self, device: DeviceId) -> CoreResult<Device> {
        let record = self
            .ctx
            .update_device(device, |record| {
                record.status = DeviceStatus::Offline;
                Ok(())
            })
            .await?;
        tracing::warn!(device = %device, "device offline");
        let mut entry = EventLogEntry::new(EventKind::DeviceOffline, device, "marked offline")
            .with_severity(Severity::Warning);
        if let Some(cluster) = record.cluster {
            entry = entry.with_cluster(cluster);
        }
        emit(self.ctx.store.as_ref(), entry).await;

        if let Some(cluster) = record.cluster {
            match self.handle(cluster).await {
                Ok(handle) => {
                    handle
                        .call(|reply| Command::DeviceOffline { device, reply })
                        .await?;
                }
                Err(err) => tracing::debug!(cluster = %cluster, error = %err, "offline device's cluster unavailable"),
            }
        }
        Ok(record)
    }

    /// Add a device to a cluster; elects a leader if the cluster has none
    ///
    /// # Errors
    ///
    /// `Conflict` if the device already belongs to a cluster, `NotFound` for
    /// an unknown cluster or device
    pub async fn join_cluster(&self, cluster: ClusterId, device: DeviceId) -> CoreResult<Cluster> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::Join { device, reply })
            .await
    }

    /// Remove a device from a cluster; the last member leaving dissolves it
    ///
    /// # Errors
    ///
    /// `Conflict` if the device is not a member
    pub async fn leave_cluster(&self, cluster: ClusterId, device: DeviceId) -> CoreResult<Cluster> {
        let updated = self
            .handle(cluster)
            .await?
            .call(|reply| Command::Leave { device, reply })
            .await?;
        if updated.is_dissolved() {
            self.clusters.write().await.remove(&cluster);
        }
        Ok(updated)
    }

    // election

    /// Run an election in a fresh term
    ///
    /// # Errors
    ///
    /// `NotFound` when no member is electable, `Timeout` when no candidate
    /// reached a majority within the retry budget
    pub async fn start_election(&self, cluster: ClusterId) -> CoreResult<LeaderAnnouncement> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::StartElection { reply })
            .await
    }

    /// Drop the current leader and re-elect. With no electable member left
    /// the cluster becomes degraded and `None` is returned.
    ///
    /// # Errors
    ///
    /// `Timeout` when the re-election fails
    pub async fn on_leader_lost(&self, cluster: ClusterId) -> CoreResult<Option<LeaderAnnouncement>> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::LeaderLost { reply })
            .await
    }

    /// Current leader, if any
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster
    pub async fn leader(&self, cluster: ClusterId) -> CoreResult<Option<DeviceId>> {
        Ok(self.get_cluster(cluster).await?.leader)
    }

    /// Validate a leadership claim against the cluster's current term
    ///
    /// # Errors
    ///
    /// `Conflict` for a stale term or a device that is not the recognized leader
    pub async fn claim_leadership(&self, cluster: ClusterId, device: DeviceId, term: Term) -> CoreResult<()> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::ClaimLeadership { device, term, reply })
            .await
    }

    // vector clocks

    /// Advance `device`'s clock entry for an event and return the new clock
    ///
    /// # Errors
    ///
    /// `Conflict` if the device is not a non-faulty member
    pub async fn record_event(
        &self,
        cluster: ClusterId,
        device: DeviceId,
        message: impl Into<String>,
    ) -> CoreResult<VectorClock> {
        let message = message.into();
        self.handle(cluster)
            .await?
            .call(|reply| Command::RecordEvent {
                device,
                message,
                reply,
            })
            .await
    }

    /// Merge a clock received from `sender` into the cluster's clock
    ///
    /// # Errors
    ///
    /// `Conflict` if the sender is not a non-faulty member
    pub async fn merge_clock(
        &self,
        cluster: ClusterId,
        sender: DeviceId,
        incoming: VectorClock,
    ) -> CoreResult<VectorClock> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::MergeClock {
                sender,
                clock: incoming,
                reply,
            })
            .await
    }

    /// Whether `a` causally precedes `b`
    #[must_use]
    pub fn happens_before(a: &VectorClock, b: &VectorClock) -> bool {
        a.happens_before(b)
    }

    /// Causal relation between two clocks
    #[must_use]
    pub fn causal_order(a: &VectorClock, b: &VectorClock) -> CausalOrder {
        a.compare(b)
    }

    /// Audit entries of a cluster in causal order, wall clock breaking ties.
    /// Only the newest `history_limit` entries are returned.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster, `Storage` if the log cannot be read
    pub async fn causal_history(
        &self,
        cluster: ClusterId,
        since: Option<DateTime<Utc>>,
    ) -> CoreResult<CausalHistory> {
        self.get_cluster(cluster).await?;
        let entries = self.ctx.store.entries_for(cluster, since).await?;
        Ok(CausalHistory::newest(entries, self.ctx.config.history_limit))
    }

    // mutual exclusion

    /// Request a resource without waiting
    ///
    /// # Errors
    ///
    /// `Conflict` if the device is not a non-faulty member
    pub async fn request_resource(
        &self,
        cluster: ClusterId,
        device: DeviceId,
        resource: &str,
    ) -> CoreResult<MutexOutcome> {
        let resource = resource.to_string();
        self.handle(cluster)
            .await?
            .call(|reply| Command::RequestResource {
                device,
                resource,
                reply,
            })
            .await
    }

    /// Request a resource and wait until it is granted
    ///
    /// # Errors
    ///
    /// `Timeout` (resource unavailable) if the grant does not arrive within
    /// the cluster's request timeout; a grant arriving later is handed on
    pub async fn acquire_resource(&self, cluster: ClusterId, device: DeviceId, resource: &str) -> CoreResult<()> {
        let handle = self.handle(cluster).await?;
        let name = resource.to_string();
        let acquisition = handle
            .call(|reply| Command::AcquireResource {
                device,
                resource: name,
                reply,
            })
            .await?;
        let (grant, timeout) = match acquisition {
            Acquisition::Granted => return Ok(()),
            Acquisition::Waiting { grant, timeout } => (grant, timeout),
        };
        if let Ok(Ok(())) = tokio::time::timeout(timeout, grant).await {
            return Ok(());
        }

        let name = resource.to_string();
        handle
            .call(|reply| Command::CancelRequest {
                device,
                resource: name,
                reply,
            })
            .await?;
        tracing::debug!(cluster = %cluster, device = %device, resource, "resource request timed out");
        Err(MutexError::ResourceUnavailable {
            resource: resource.to_string(),
            device,
        }
        .into())
    }

    /// Release a resource; returns the next holder
    ///
    /// # Errors
    ///
    /// `Conflict` if `device` does not hold the resource, `NotFound` if the
    /// resource was never requested
    pub async fn release_resource(
        &self,
        cluster: ClusterId,
        device: DeviceId,
        resource: &str,
    ) -> CoreResult<Option<DeviceId>> {
        let resource = resource.to_string();
        self.handle(cluster)
            .await?
            .call(|reply| Command::ReleaseResource {
                device,
                resource,
                reply,
            })
            .await
    }

    /// Current holder of a resource
    ///
    /// # Errors
    ///
    /// `NotFound` if the resource was never requested
    pub async fn resource_holder(&self, cluster: ClusterId, resource: &str) -> CoreResult<Option<DeviceId>> {
        let resource = resource.to_string();
        self.handle(cluster)
            .await?
            .call(|reply| Command::ResourceHolder { resource, reply })
            .await
    }

    // agreement

    /// Propose a value to the non-faulty members and wait for the outcome
    ///
    /// # Errors
    ///
    /// `QuorumNotReached` when the proposal aborts
    pub async fn propose_agreement(&self, cluster: ClusterId, value: serde_json::Value) -> CoreResult<Proposal> {
        let handle = self.handle(cluster).await?;
        let Submitted {
            proposal,
            decided,
            timeout,
        } = handle.call(|reply| Command::Propose { value, reply }).await?;
        if !proposal.is_final() {
            self.collect_votes(handle.clone(), &proposal, timeout);
        }

        let decided = match tokio::time::timeout(timeout, decided).await {
            Ok(Ok(decided)) => decided,
            _ => {
                let id = proposal.id;
                handle
                    .call(|reply| Command::ExpireProposal { proposal: id, reply })
                    .await?
            }
        };
        match decided.outcome {
            Outcome::Committed => Ok(decided),
            Outcome::Aborted | Outcome::Pending => Err(CoreError::QuorumNotReached {
                have: decided.matching(),
                needed: decided.quorum,
            }),
        }
    }

    /// Ask every eligible member for its vote and feed replies back as
    /// they arrive
    fn collect_votes(&self, handle: ClusterHandle, proposal: &Proposal, timeout: Duration) {
        let network = Arc::clone(&self.ctx.network);
        let ballot = proposal.ballot();
        let voters: Vec<DeviceId> = proposal.eligible.iter().copied().collect();
        tokio::spawn(async move {
            let collect = async {
                let mut replies: FuturesUnordered<_> = voters
                    .into_iter()
                    .map(|voter| {
                        let network = &network;
                        async move { (voter, network.request_vote(voter, &ballot).await) }
                    })
                    .collect();
                while let Some((voter, reply)) = replies.next().await {
                    let votes = match reply {
                        Ok(votes) => votes,
                        Err(err) => {
                            tracing::debug!(voter = %voter, error = %err, "no vote");
                            continue;
                        }
                    };
                    for vote in votes {
                        if let Err(err) = handle.call(|reply| Command::Vote { vote, reply }).await {
                            tracing::debug!(voter = %voter, error = %err, "vote rejected");
                        }
                    }
                }
            };
            if tokio::time::timeout(timeout, collect).await.is_err() {
                tracing::debug!(proposal = %ballot.proposal, "vote collection timed out");
            }
        });
    }

    /// Submit a vote received out of band
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown proposal, `Conflict` for an ineligible voter
    pub async fn cast_vote(&self, cluster: ClusterId, vote: Vote) -> CoreResult<VoteEffect> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::Vote { vote, reply })
            .await
    }

    /// Members currently classified faulty. Newly faulty members lose their
    /// tokens and votes; a faulty leader is replaced.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster
    pub async fn detect_faulty_nodes(&self, cluster: ClusterId) -> CoreResult<BTreeSet<DeviceId>> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::DetectFaulty { reply })
            .await
    }

    /// Health classification of every member
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown cluster
    pub async fn health(&self, cluster: ClusterId) -> CoreResult<HealthReport> {
        Ok(self.cluster_status(cluster).await?.health)
    }

    // checkpoints and recovery

    /// Commit `data` as the cluster's next checkpoint
    ///
    /// # Errors
    ///
    /// `Storage` once retries are exhausted
    pub async fn create_checkpoint(&self, cluster: ClusterId, data: Vec<u8>) -> CoreResult<Checkpoint> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::CreateCheckpoint { data, reply })
            .await
    }

    /// Checkpoint the cluster's agreed state
    ///
    /// # Errors
    ///
    /// `Storage` once retries are exhausted
    pub async fn checkpoint_state(&self, cluster: ClusterId) -> CoreResult<Checkpoint> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::SnapshotCheckpoint { reply })
            .await
    }

    /// Load a checkpoint, the newest when `id` is `None`. Membership is not
    /// changed; run an election and fault detection afterwards.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent, `InvariantViolation` if its digest fails (the
    /// coordinator resynchronizes before replying)
    pub async fn restore_from_checkpoint(
        &self,
        cluster: ClusterId,
        id: Option<CheckpointId>,
    ) -> CoreResult<Checkpoint> {
        self.handle(cluster)
            .await?
            .call(|reply| Command::Restore { id, reply })
            .await
    }

    /// Retained checkpoints, newest first
    ///
    /// # Errors
    ///
    /// `Storage` if the store cannot be read
    pub async fn list_checkpoints(&self, cluster: ClusterId, limit: usize) -> CoreResult<Vec<Checkpoint>> {
        self.checkpoints.list(cluster, limit).await
    }

    /// Mark the start of a recovery; returns the in-progress one if any
    ///
    /// # Errors
    ///
    /// `Storage` if the marker cannot be written
    pub async fn initiate_recovery(&self, cluster: ClusterId, reason: &str) -> CoreResult<RecoveryRecord> {
        let reason = reason.to_string();
        self.handle(cluster)
            .await?
            .call(|reply| Command::InitiateRecovery { reason, reply })
            .await
    }

    /// Mark a recovery finished; repeating returns the first outcome
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown recovery
    pub async fn complete_recovery(
        &self,
        id: RecoveryId,
        success: bool,
        details: &str,
    ) -> CoreResult<RecoveryRecord> {
        let record = self.checkpoints.recovery(id).await?;
        match self.handle(record.cluster).await {
            Ok(handle) => {
                let details = details.to_string();
                handle
                    .call(|reply| Command::CompleteRecovery {
                        id,
                        success,
                        details,
                        reply,
                    })
                    .await
            }
            // a dissolved cluster has no coordinator left to serialize against
            Err(_) => self.checkpoints.complete_recovery(id, success, details).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerBehaviour, SimNetwork};
    use dasas_core::{ClusterState, ErrorKind, VectorClockSettings};
    use dasas_log::EventHistory;
    use dasas_storage::{CheckpointStore, MembershipStore, MemoryStore};
    use serde_json::json;

    struct Fixture {
        engine: CoordinationEngine,
        store: MemoryStore,
        network: SimNetwork,
        cluster: ClusterId,
        devices: Vec<DeviceId>,
    }

    async fn fixture_with(members: usize, config: EngineConfig, settings: Option<ClusterSettings>) -> Fixture {
        let store = MemoryStore::new();
        let network = SimNetwork::with_default(PeerBehaviour::Honest);
        let engine = CoordinationEngine::new(Arc::new(store.clone()), Arc::new(network.clone()), config).unwrap();
        let cluster = engine.create_cluster("c1", settings).await.unwrap().id;
        let mut devices = Vec::new();
        for i in 0..members {
            let device = engine.register_device(&format!("d{i}"), ["ocr"]).await.unwrap();
            engine.join_cluster(cluster, device.id).await.unwrap();
            devices.push(device.id);
        }
        Fixture {
            engine,
            store,
            network,
            cluster,
            devices,
        }
    }

    async fn fixture(members: usize) -> Fixture {
        fixture_with(members, EngineConfig::default(), None).await
    }

    #[tokio::test]
    async fn test_first_join_elects_and_activates() {
        let fx = fixture(1).await;
        let cluster = fx.engine.get_cluster(fx.cluster).await.unwrap();
        assert_eq!(cluster.leader, Some(fx.devices[0]));
        assert_eq!(cluster.state, ClusterState::Active);
        assert_eq!(cluster.term, Term::from_raw(1));
    }

    #[tokio::test]
    async fn test_election_yields_one_agreed_leader() {
        let fx = fixture(3).await;
        let before = fx.engine.get_cluster(fx.cluster).await.unwrap().term;
        let announcement = fx.engine.start_election(fx.cluster).await.unwrap();
        assert!(announcement.term > before);
        assert_eq!(fx.engine.leader(fx.cluster).await.unwrap(), Some(announcement.leader));
        for device in &fx.devices {
            let view = fx.network.view(*device, fx.cluster).await.unwrap();
            assert_eq!(view.leader, Some(announcement.leader));
            assert_eq!(view.term, announcement.term);
        }
    }

    #[tokio::test]
    async fn test_start_election_without_members_fails() {
        let fx = fixture(0).await;
        let err = fx.engine.start_election(fx.cluster).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_partitioned_majority_times_out() {
        let mut config = EngineConfig::default();
        config.election.max_retries = 1;
        config.election.backoff_base_ms = 1;
        let settings = ClusterSettings::default().with_election_timeout(100);
        let fx = fixture_with(3, config, Some(settings)).await;
        fx.network.partition(fx.devices.clone()).await;
        let err = fx.engine.start_election(fx.cluster).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(fx.engine.leader(fx.cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leader_leaving_triggers_reelection() {
        let fx = fixture(3).await;
        let old = fx.engine.leader(fx.cluster).await.unwrap().unwrap();
        fx.engine.leave_cluster(fx.cluster, old).await.unwrap();
        let new = fx.engine.leader(fx.cluster).await.unwrap().unwrap();
        assert_ne!(old, new);
        assert!(fx.devices.contains(&new));
    }

    #[tokio::test]
    async fn test_offline_leader_is_replaced() {
        let fx = fixture(3).await;
        let old = fx.engine.leader(fx.cluster).await.unwrap().unwrap();
        fx.engine.mark_offline(old).await.unwrap();
        let new = fx.engine.leader(fx.cluster).await.unwrap();
        assert!(new.is_some() && new != Some(old));
        assert!(fx.engine.detect_faulty_nodes(fx.cluster).await.unwrap().contains(&old));
    }

    #[tokio::test]
    async fn test_leader_lost_without_electable_members_degrades() {
        let fx = fixture(2).await;
        for device in &fx.devices {
            fx.engine.mark_offline(*device).await.unwrap();
        }
        assert_eq!(fx.engine.on_leader_lost(fx.cluster).await.unwrap(), None);
        let cluster = fx.engine.get_cluster(fx.cluster).await.unwrap();
        assert_eq!(cluster.state, ClusterState::Degraded);
        assert_eq!(cluster.leader, None);
    }

    #[tokio::test]
    async fn test_stale_leadership_claim_rejected() {
        let fx = fixture(3).await;
        let old = fx.engine.leader(fx.cluster).await.unwrap().unwrap();
        let old_term = fx.engine.get_cluster(fx.cluster).await.unwrap().term;
        let current = fx.engine.start_election(fx.cluster).await.unwrap();

        let err = fx.engine.claim_leadership(fx.cluster, old, old_term).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(
            fx.engine
                .claim_leadership(fx.cluster, current.leader, current.term)
                .await
                .is_ok()
        );
        let view = fx.network.view(old, fx.cluster).await.unwrap();
        assert_eq!(view.leader, Some(current.leader));
    }

    #[tokio::test]
    async fn test_membership_conflicts_and_auto_dissolve() {
        let fx = fixture(1).await;
        let device = fx.devices[0];
        let err = fx.engine.join_cluster(fx.cluster, device).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let other = fx.engine.create_cluster("c2", None).await.unwrap();
        let err = fx.engine.join_cluster(other.id, device).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stranger = fx.engine.register_device("stranger", Vec::<String>::new()).await.unwrap();
        let err = fx.engine.leave_cluster(fx.cluster, stranger.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let cluster = fx.engine.leave_cluster(fx.cluster, device).await.unwrap();
        assert_eq!(cluster.state, ClusterState::Dissolved);
        assert_eq!(fx.engine.get_device(device).await.unwrap().cluster, None);
        let err = fx.engine.cluster_status(fx.cluster).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_dissolve_detaches_members() {
        let fx = fixture(2).await;
        let cluster = fx.engine.dissolve_cluster(fx.cluster).await.unwrap();
        assert!(cluster.is_dissolved());
        for device in &fx.devices {
            assert_eq!(fx.engine.get_device(*device).await.unwrap().cluster, None);
        }
        assert!(fx.engine.active_clusters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_cluster_write_leaves_membership_unchanged() {
        let fx = fixture(2).await;
        let late = fx.engine.register_device("late", ["ocr"]).await.unwrap();
        fx.store.fail_next_cluster_writes(usize::MAX);

        let err = fx.engine.join_cluster(fx.cluster, late.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(fx.engine.get_device(late.id).await.unwrap().cluster, None);

        let err = fx.engine.leave_cluster(fx.cluster, fx.devices[1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(
            fx.engine.get_device(fx.devices[1]).await.unwrap().cluster,
            Some(fx.cluster)
        );

        let err = fx.engine.dissolve_cluster(fx.cluster).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        for device in &fx.devices {
            assert_eq!(fx.engine.get_device(*device).await.unwrap().cluster, Some(fx.cluster));
        }

        fx.store.fail_next_cluster_writes(0);
        let status = fx.engine.cluster_status(fx.cluster).await.unwrap();
        assert_eq!(status.cluster.member_count, 2);
        assert_eq!(status.cluster.state, ClusterState::Active);
        assert_eq!(fx.store.get_cluster(fx.cluster).await.unwrap().unwrap().member_count, 2);

        let cluster = fx.engine.leave_cluster(fx.cluster, fx.devices[1]).await.unwrap();
        assert_eq!(cluster.member_count, 1);
        assert_eq!(fx.engine.join_cluster(fx.cluster, late.id).await.unwrap().member_count, 2);
    }

    #[tokio::test]
    async fn test_update_cluster_applies_settings() {
        let fx = fixture(3).await;
        let departed = fx.devices[2];
        fx.engine.record_event(fx.cluster, departed, "last words").await.unwrap();
        fx.engine.leave_cluster(fx.cluster, departed).await.unwrap();
        let status = fx.engine.cluster_status(fx.cluster).await.unwrap();
        assert!(status.clock.get(&departed) > 0);

        let settings = ClusterSettings {
            vector_clock: VectorClockSettings {
                retention_ms: 0,
                max_entries: 100,
            },
            ..ClusterSettings::default().with_request_timeout(250)
        };
        let cluster = fx
            .engine
            .update_cluster(fx.cluster, Some(" line-a "), Some(settings.clone()))
            .await
            .unwrap();
        assert_eq!(cluster.name, "line-a");
        assert_eq!(cluster.settings, settings);
        assert_eq!(fx.engine.get_cluster(fx.cluster).await.unwrap(), cluster);

        // departed entries now fall outside retention
        let status = fx.engine.cluster_status(fx.cluster).await.unwrap();
        assert_eq!(status.clock.get(&departed), 0);

        let err = fx
            .engine
            .update_cluster(fx.cluster, Some("  "), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fx.engine.get_cluster(fx.cluster).await.unwrap().name, "line-a");

        fx.engine.dissolve_cluster(fx.cluster).await.unwrap();
        let err = fx
            .engine
            .update_cluster(fx.cluster, Some("line-b"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_search_clusters_by_name_or_id() {
        let fx = fixture(0).await;
        let lab = fx.engine.create_cluster("OCR Lab", None).await.unwrap();
        let dock = fx.engine.create_cluster("loading dock", None).await.unwrap();

        let found = fx.engine.search_clusters("lab").await.unwrap();
        assert_eq!(found.iter().map(|c| c.id).collect::<Vec<_>>(), vec![lab.id]);

        let id = dock.id.to_string();
        let found = fx.engine.search_clusters(&id[id.len() - 8..]).await.unwrap();
        assert_eq!(found.iter().map(|c| c.id).collect::<Vec<_>>(), vec![dock.id]);

        let names: Vec<String> = fx
            .engine
            .search_clusters("")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["OCR Lab", "c1", "loading dock"]);
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let fx = fixture(0).await;
        let err = fx.engine.cluster_status(ClusterId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resource_granted_fifo() {
        let fx = fixture(3).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        assert_eq!(
            fx.engine.request_resource(fx.cluster, a, "R").await.unwrap(),
            MutexOutcome::Granted
        );
        assert_eq!(
            fx.engine.request_resource(fx.cluster, b, "R").await.unwrap(),
            MutexOutcome::Queued { position: 1 }
        );
        assert_eq!(fx.engine.release_resource(fx.cluster, a, "R").await.unwrap(), Some(b));
        assert_eq!(fx.engine.resource_holder(fx.cluster, "R").await.unwrap(), Some(b));

        let err = fx.engine.release_resource(fx.cluster, a, "R").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = fx.engine.resource_holder(fx.cluster, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let fx = fixture(2).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        fx.engine.acquire_resource(fx.cluster, a, "R").await.unwrap();

        let engine = fx.engine.clone();
        let cluster = fx.cluster;
        let waiter = tokio::spawn(async move { engine.acquire_resource(cluster, b, "R").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.engine.release_resource(fx.cluster, a, "R").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(fx.engine.resource_holder(fx.cluster, "R").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_acquire_times_out_and_withdraws() {
        let settings = ClusterSettings::default().with_request_timeout(30);
        let fx = fixture_with(2, EngineConfig::default(), Some(settings)).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        fx.engine.acquire_resource(fx.cluster, a, "R").await.unwrap();
        let err = fx.engine.acquire_resource(fx.cluster, b, "R").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // b gave up, so the token parks instead of moving to b
        assert_eq!(fx.engine.release_resource(fx.cluster, a, "R").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leaving_holder_hands_token_on() {
        let fx = fixture(3).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        fx.engine.request_resource(fx.cluster, a, "R").await.unwrap();
        fx.engine.request_resource(fx.cluster, b, "R").await.unwrap();
        fx.engine.leave_cluster(fx.cluster, a).await.unwrap();
        assert_eq!(fx.engine.resource_holder(fx.cluster, "R").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_agreement_commits_with_silent_member() {
        let config = EngineConfig::default()
            .with_fault_tolerance(0)
            .with_quorum_size(2)
            .with_agreement_timeout(500);
        let fx = fixture_with(3, config, None).await;
        fx.network
            .set_behaviour(fx.devices[2], PeerBehaviour::Crashed)
            .await;
        let proposal = fx
            .engine
            .propose_agreement(fx.cluster, json!("V1"))
            .await
            .unwrap();
        assert_eq!(proposal.outcome, Outcome::Committed);
        assert_eq!(proposal.value, json!("V1"));
        assert_eq!(proposal.quorum, 2);
    }

    #[tokio::test]
    async fn test_agreement_aborts_without_quorum() {
        let config = EngineConfig::default()
            .with_fault_tolerance(0)
            .with_quorum_size(2)
            .with_agreement_timeout(100);
        let fx = fixture_with(3, config, None).await;
        for device in &fx.devices[1..] {
            fx.network.set_behaviour(*device, PeerBehaviour::Crashed).await;
        }
        let err = fx
            .engine
            .propose_agreement(fx.cluster, json!("V1"))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::QuorumNotReached { have: 1, needed: 2 });
    }

    #[tokio::test]
    async fn test_committed_outcome_is_final() {
        let config = EngineConfig::default().with_fault_tolerance(0).with_agreement_timeout(500);
        let fx = fixture_with(3, config, None).await;
        let proposal = fx.engine.propose_agreement(fx.cluster, json!(7)).await.unwrap();
        for device in &fx.devices {
            let vote = Vote {
                proposal: proposal.id,
                voter: *device,
                value: proposal.digest,
                accept: false,
            };
            assert_eq!(fx.engine.cast_vote(fx.cluster, vote).await.unwrap(), VoteEffect::Ignored);
        }
        let err = fx
            .engine
            .cast_vote(
                fx.cluster,
                Vote {
                    proposal: dasas_core::ProposalId::new(),
                    voter: fx.devices[0],
                    value: proposal.digest,
                    accept: true,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_equivocating_member_is_isolated() {
        let config = EngineConfig::default().with_fault_tolerance(1).with_agreement_timeout(1_000);
        let fx = fixture_with(4, config, None).await;
        let liar = fx.devices[3];
        for device in &fx.devices[..3] {
            fx.network.set_behaviour(*device, PeerBehaviour::Delayed(50)).await;
        }
        fx.network.set_behaviour(liar, PeerBehaviour::Equivocating).await;

        let proposal = fx.engine.propose_agreement(fx.cluster, json!("cfg")).await.unwrap();
        assert!(!proposal.eligible.contains(&liar));
        assert_eq!(proposal.matching(), 3);

        let faulty = fx.engine.detect_faulty_nodes(fx.cluster).await.unwrap();
        assert!(faulty.contains(&liar));
        let err = fx.engine.request_resource(fx.cluster, liar, "R").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // a clean rejoin clears the flag
        fx.engine.leave_cluster(fx.cluster, liar).await.unwrap();
        fx.engine.join_cluster(fx.cluster, liar).await.unwrap();
        assert!(!fx.engine.detect_faulty_nodes(fx.cluster).await.unwrap().contains(&liar));
    }

    #[tokio::test]
    async fn test_vector_clock_and_history() {
        let fx = fixture(2).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        let first = fx.engine.record_event(fx.cluster, a, "capture").await.unwrap();
        let second = fx.engine.record_event(fx.cluster, b, "ocr").await.unwrap();
        assert!(CoordinationEngine::happens_before(&first, &second));
        assert!(!CoordinationEngine::happens_before(&second, &first));

        let mut remote = VectorClock::new();
        remote.tick(a);
        remote.tick(a);
        remote.tick(a);
        let merged = fx.engine.merge_clock(fx.cluster, a, remote.clone()).await.unwrap();
        assert_eq!(merged.get(&a), 3);
        assert_eq!(CoordinationEngine::causal_order(&second, &remote), CausalOrder::Concurrent);

        let history: Vec<String> = fx
            .engine
            .causal_history(fx.cluster, None)
            .await
            .unwrap()
            .filter(|e| e.kind == EventKind::VectorClockUpdate)
            .map(|e| e.message)
            .collect();
        assert_eq!(history, vec!["capture".to_string(), "ocr".to_string()]);

        let outsider = fx.engine.register_device("x", Vec::<String>::new()).await.unwrap();
        let err = fx.engine.record_event(fx.cluster, outsider.id, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_history_orders_grant_after_request_by_clock() {
        let fx = fixture(2).await;
        let (a, b) = (fx.devices[0], fx.devices[1]);
        fx.engine.request_resource(fx.cluster, a, "R").await.unwrap();
        fx.engine.request_resource(fx.cluster, b, "R").await.unwrap();
        fx.engine.release_resource(fx.cluster, a, "R").await.unwrap();

        let mut entries = fx.store.entries_for(fx.cluster, None).await.unwrap();
        assert!(
            entries
                .iter()
                .filter(|e| e.kind != EventKind::ClusterCreated)
                .all(|e| e.clock.is_some())
        );

        // later entries get earlier wall-clock stamps; only the clocks can order them
        let base = Utc::now();
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.timestamp = base - chrono::Duration::seconds(i as i64);
        }
        let ordered: Vec<(EventKind, String)> = CausalHistory::new(entries)
            .map(|e| (e.kind, e.source))
            .collect();
        let position = |kind: EventKind| {
            ordered
                .iter()
                .position(|(k, source)| *k == kind && *source == b.to_string())
                .unwrap()
        };
        assert!(position(EventKind::ResourceRequested) < position(EventKind::ResourceGranted));
    }

    #[tokio::test]
    async fn test_causal_history_is_capped() {
        let fx = fixture_with(1, EngineConfig::default().with_history_limit(3), None).await;
        let device = fx.devices[0];
        for n in 0..5 {
            fx.engine
                .record_event(fx.cluster, device, format!("e{n}"))
                .await
                .unwrap();
        }
        let history: Vec<String> = fx
            .engine
            .causal_history(fx.cluster, None)
            .await
            .unwrap()
            .map(|e| e.message)
            .collect();
        assert_eq!(history, vec!["e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn test_restore_latest_and_by_id() {
        let fx = fixture(3).await;
        let first = fx.engine.create_checkpoint(fx.cluster, b"one".to_vec()).await.unwrap();
        let second = fx.engine.create_checkpoint(fx.cluster, b"two".to_vec()).await.unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let latest = fx.engine.restore_from_checkpoint(fx.cluster, None).await.unwrap();
        assert_eq!((latest.sequence, latest.data.as_slice()), (2, &b"two"[..]));
        let older = fx
            .engine
            .restore_from_checkpoint(fx.cluster, Some(first.id))
            .await
            .unwrap();
        assert_eq!((older.sequence, older.data.as_slice()), (1, &b"one"[..]));

        let err = fx
            .engine
            .restore_from_checkpoint(fx.cluster, Some(CheckpointId::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_sequences_increase_across_failed_writes() {
        let fx = fixture(1).await;
        let mut last = 0;
        for round in 0..4 {
            fx.store.fail_next_writes(round % 3);
            let checkpoint = fx.engine.create_checkpoint(fx.cluster, vec![round as u8]).await.unwrap();
            assert!(checkpoint.sequence > last);
            last = checkpoint.sequence;
        }
        assert_eq!(last, 4);
    }

    #[tokio::test]
    async fn test_state_checkpoint_captures_agreed_value() {
        let config = EngineConfig::default().with_fault_tolerance(0).with_agreement_timeout(500);
        let fx = fixture_with(3, config, None).await;
        fx.engine.propose_agreement(fx.cluster, json!({"fps": 2})).await.unwrap();
        let checkpoint = fx.engine.checkpoint_state(fx.cluster).await.unwrap();
        let snapshot = crate::checkpoint::ClusterSnapshot::decode(&checkpoint.data).unwrap();
        assert_eq!(snapshot.agreed, Some(json!({"fps": 2})));
        assert_eq!(snapshot.members.len(), 3);
        assert!(snapshot.leader.is_some());

        let status = fx.engine.cluster_status(fx.cluster).await.unwrap();
        assert_eq!(status.latest_checkpoint, Some(1));
        assert_eq!(status.pending_proposals, 0);
    }

    #[tokio::test]
    async fn test_corrupted_checkpoint_forces_resync() {
        let fx = fixture(3).await;
        fx.engine.request_resource(fx.cluster, fx.devices[0], "R").await.unwrap();
        let term = fx.engine.get_cluster(fx.cluster).await.unwrap().term;

        let mut corrupt = Checkpoint::new(fx.cluster, 1, b"state".to_vec());
        corrupt.data = b"tampered".to_vec();
        let audit = EventLogEntry::new(EventKind::CheckpointCreated, fx.cluster, "seeded");
        fx.store.commit_checkpoint(&corrupt, &audit).await.unwrap();

        let err = fx.engine.restore_from_checkpoint(fx.cluster, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);

        let status = fx.engine.cluster_status(fx.cluster).await.unwrap();
        assert!(status.cluster.term > term);
        assert!(status.cluster.leader.is_some());
        assert!(status.held.is_empty());
        assert!(
            fx.store
                .events()
                .await
                .iter()
                .any(|e| e.kind == EventKind::InvariantViolation && e.severity == Severity::Critical)
        );
    }

    #[tokio::test]
    async fn test_recovery_through_engine() {
        let fx = fixture(1).await;
        let started = fx.engine.initiate_recovery(fx.cluster, "partition healed").await.unwrap();
        let duplicate = fx.engine.initiate_recovery(fx.cluster, "again").await.unwrap();
        assert_eq!(started.id, duplicate.id);
        let done = fx.engine.complete_recovery(started.id, true, "restored").await.unwrap();
        let repeat = fx.engine.complete_recovery(started.id, false, "late").await.unwrap();
        assert_eq!(done, repeat);
    }

    #[tokio::test]
    async fn test_clusters_are_independent() {
        let fx = fixture(1).await;
        let other = fx.engine.create_cluster("c2", None).await.unwrap();
        let device = fx.engine.register_device("solo", Vec::<String>::new()).await.unwrap();
        fx.engine.join_cluster(other.id, device.id).await.unwrap();

        fx.engine.request_resource(fx.cluster, fx.devices[0], "R").await.unwrap();
        assert_eq!(
            fx.engine.request_resource(other.id, device.id, "R").await.unwrap(),
            MutexOutcome::Granted
        );
        let a = fx.engine.create_checkpoint(fx.cluster, vec![]).await.unwrap();
        let b = fx.engine.create_checkpoint(other.id, vec![]).await.unwrap();
        assert_eq!((a.sequence, b.sequence), (1, 1));
    }
}
