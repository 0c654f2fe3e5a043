//! Per-cluster coordinator.
//!
//! Each cluster gets one task that owns its leader, token, clock, proposal and
//! checkpoint-sequence state and applies commands strictly one at a time.
//! Callers reach it through a [`ClusterHandle`]; different clusters never
//! share a lock.

use crate::agreement::{AgreementError, Outcome, Proposal, Vote, VoteEffect};
use crate::checkpoint::{CheckpointManager, ClusterSnapshot};
use crate::config::EngineConfig;
use crate::election::{self, Candidacy, ElectionError, LeaderAnnouncement, RoundOutcome};
use crate::health::HealthReport;
use crate::mutex::{MutexCoordinator, MutexOutcome, Withdrawal};
use crate::network::PeerNetwork;
use crate::vclock::ClockService;
use chrono::Utc;
use dasas_core::{
    CheckpointId, Cluster, ClusterId, ClusterSettings, ClusterState, CoreError, CoreResult, Device, DeviceId, ErrorKind,
    ProposalId, RecoveryId, Term, VectorClock, retry_with_backoff,
};
use dasas_log::{EventKind, EventLogEntry, Severity, emit};
use dasas_storage::{Checkpoint, RecoveryRecord, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};

const COMMAND_BUFFER: usize = 256;

/// Decided proposals kept so late votes and expiry checks still resolve
const DECIDED_RETAINED: usize = 256;

pub(crate) type Reply<T> = oneshot::Sender<CoreResult<T>>;

/// Serializes read-modify-write of device records
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceLocks {
    locks: Arc<Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>>,
}

impl DeviceLocks {
    pub(crate) async fn lock(&self, device: DeviceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(device).or_default())
        };
        lock.lock_owned().await
    }
}

/// Shared by the engine and every coordinator
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) network: Arc<dyn PeerNetwork>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) locks: DeviceLocks,
}

impl EngineContext {
    /// Load, change and write back a device under its lock
    pub(crate) async fn update_device(
        &self,
        id: DeviceId,
        change: impl FnOnce(&mut Device) -> CoreResult<()>,
    ) -> CoreResult<Device> {
        let _guard = self.locks.lock(id).await;
        let mut device = self
            .store
            .get_device(id)
            .await?
            .ok_or_else(|| CoreError::not_found("device", id))?;
        change(&mut device)?;
        self.write_device(&device).await?;
        Ok(device)
    }

    pub(crate) async fn write_device(&self, device: &Device) -> CoreResult<()> {
        let store = &self.store;
        retry_with_backoff(self.config.storage_retry, "upsert device", || async move {
            store.upsert_device(device).await.map_err(CoreError::from)
        })
        .await
    }

    pub(crate) async fn write_cluster(&self, cluster: &Cluster) -> CoreResult<()> {
        let store = &self.store;
        retry_with_backoff(self.config.storage_retry, "upsert cluster", || async move {
            store.upsert_cluster(cluster).await.map_err(CoreError::from)
        })
        .await
    }
}

/// Point-in-time view of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Cluster record, including state, term and leader
    pub cluster: Cluster,
    /// Member health classification
    pub health: HealthReport,
    /// Held resources and their holders
    pub held: BTreeMap<String, DeviceId>,
    /// Proposals still collecting votes
    pub pending_proposals: usize,
    /// Highest durable checkpoint sequence
    pub latest_checkpoint: Option<u64>,
    /// Current cluster clock
    pub clock: VectorClock,
}

/// Result of a blocking resource request
#[derive(Debug)]
pub(crate) enum Acquisition {
    Granted,
    Waiting {
        grant: oneshot::Receiver<()>,
        timeout: Duration,
    },
}

/// A proposal handed to the caller together with its decision channel
#[derive(Debug)]
pub(crate) struct Submitted {
    pub(crate) proposal: Proposal,
    pub(crate) decided: oneshot::Receiver<Proposal>,
    pub(crate) timeout: Duration,
}

#[derive(Debug)]
pub(crate) enum Command {
    Join {
        device: DeviceId,
        reply: Reply<Cluster>,
    },
    Leave {
        device: DeviceId,
        reply: Reply<Cluster>,
    },
    Dissolve {
        reply: Reply<Cluster>,
    },
    Update {
        name: Option<String>,
        settings: Option<ClusterSettings>,
        reply: Reply<Cluster>,
    },
    DeviceOffline {
        device: DeviceId,
        reply: Reply<()>,
    },
    StartElection {
        reply: Reply<LeaderAnnouncement>,
    },
    LeaderLost {
        reply: Reply<Option<LeaderAnnouncement>>,
    },
    ClaimLeadership {
        device: DeviceId,
        term: Term,
        reply: Reply<()>,
    },
    RecordEvent {
        device: DeviceId,
        message: String,
        reply: Reply<VectorClock>,
    },
    MergeClock {
        sender: DeviceId,
        clock: VectorClock,
        reply: Reply<VectorClock>,
    },
    RequestResource {
        device: DeviceId,
        resource: String,
        reply: Reply<MutexOutcome>,
    },
    AcquireResource {
        device: DeviceId,
        resource: String,
        reply: Reply<Acquisition>,
    },
    CancelRequest {
        device: DeviceId,
        resource: String,
        reply: Reply<()>,
    },
    ReleaseResource {
        device: DeviceId,
        resource: String,
        reply: Reply<Option<DeviceId>>,
    },
    ResourceHolder {
        resource: String,
        reply: Reply<Option<DeviceId>>,
    },
    Propose {
        value: serde_json::Value,
        reply: Reply<Submitted>,
    },
    Vote {
        vote: Vote,
        reply: Reply<VoteEffect>,
    },
    ExpireProposal {
        proposal: ProposalId,
        reply: Reply<Proposal>,
    },
    DetectFaulty {
        reply: Reply<BTreeSet<DeviceId>>,
    },
    Status {
        reply: Reply<ClusterStatus>,
    },
    CreateCheckpoint {
        data: Vec<u8>,
        reply: Reply<Checkpoint>,
    },
    SnapshotCheckpoint {
        reply: Reply<Checkpoint>,
    },
    Restore {
        id: Option<CheckpointId>,
        reply: Reply<Checkpoint>,
    },
    InitiateRecovery {
        reason: String,
        reply: Reply<RecoveryRecord>,
    },
    CompleteRecovery {
        id: RecoveryId,
        success: bool,
        details: String,
        reply: Reply<RecoveryRecord>,
    },
}

/// Sending side of a cluster coordinator
#[derive(Debug, Clone)]
pub(crate) struct ClusterHandle {
    tx: mpsc::Sender<Command>,
}

impl ClusterHandle {
    /// Send a command and wait for its reply
    pub(crate) async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> CoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)?
    }

    /// Whether the coordinator has stopped
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start a coordinator for `cluster`
pub(crate) fn spawn(ctx: EngineContext, cluster: Cluster, members: BTreeSet<DeviceId>) -> ClusterHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = ClusterActor::new(ctx, cluster, members);
    tokio::spawn(actor.run(rx));
    ClusterHandle { tx }
}

struct ClusterActor {
    ctx: EngineContext,
    cluster: Cluster,
    members: BTreeSet<DeviceId>,
    clock: ClockService,
    mutex: MutexCoordinator,
    pending: HashMap<ProposalId, Proposal>,
    decided: HashMap<ProposalId, Proposal>,
    decided_order: VecDeque<ProposalId>,
    waiters: HashMap<ProposalId, oneshot::Sender<Proposal>>,
    /// Caught equivocating; faulty until they rejoin
    contradicted: BTreeSet<DeviceId>,
    /// Faulty members already reported
    reported_faulty: BTreeSet<DeviceId>,
    /// Last committed agreement value
    agreed: Option<serde_json::Value>,
    checkpoints: CheckpointManager,
}

impl ClusterActor {
    fn new(ctx: EngineContext, cluster: Cluster, members: BTreeSet<DeviceId>) -> Self {
        let checkpoints = CheckpointManager::new(
            Arc::clone(&ctx.store),
            ctx.config.storage_retry,
            ctx.config.checkpoint.retention_count,
        );
        Self {
            clock: ClockService::new(cluster.settings.vector_clock.clone()),
            mutex: MutexCoordinator::new(),
            pending: HashMap::new(),
            decided: HashMap::new(),
            decided_order: VecDeque::new(),
            waiters: HashMap::new(),
            contradicted: BTreeSet::new(),
            reported_faulty: BTreeSet::new(),
            agreed: None,
            checkpoints,
            members,
            cluster,
            ctx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::debug!(cluster = %self.cluster.id, members = self.members.len(), "coordinator started");
        while let Some(command) = rx.recv().await {
            self.expire_overdue().await;
            if self.handle(command).await.is_break() {
                break;
            }
            if let Err(CoreError::InvariantViolation { reason }) = self.check_invariants() {
                self.resync(&reason).await;
            }
        }
        self.abort_pending().await;
        tracing::debug!(cluster = %self.cluster.id, "coordinator stopped");
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Join { device, reply } => {
                let result = self.join(device).await;
                self.finish(reply, result).await;
            }
            Command::Leave { device, reply } => {
                let result = self.leave(device).await;
                let dissolved = matches!(&result, Ok(cluster) if cluster.is_dissolved());
                self.finish(reply, result).await;
                if dissolved {
                    return ControlFlow::Break(());
                }
            }
            Command::Dissolve { reply } => {
                let result = self.dissolve("dissolved by request").await;
                let dissolved = result.is_ok();
                self.finish(reply, result).await;
                if dissolved {
                    return ControlFlow::Break(());
                }
            }
            Command::Update {
                name,
                settings,
                reply,
            } => {
                let result = self.update(name, settings).await;
                self.finish(reply, result).await;
            }
            Command::DeviceOffline { device, reply } => {
                let result = self.device_offline(device).await;
                self.finish(reply, result).await;
            }
            Command::StartElection { reply } => {
                let result = self.elect("election requested").await;
                self.finish(reply, result).await;
            }
            Command::LeaderLost { reply } => {
                let result = self.leader_lost("leader lost").await;
                self.finish(reply, result).await;
            }
            Command::ClaimLeadership { device, term, reply } => {
                let result = self.claim_leadership(device, term).await;
                self.finish(reply, result).await;
            }
            Command::RecordEvent {
                device,
                message,
                reply,
            } => {
                let result = self.record_event(device, message).await;
                self.finish(reply, result).await;
            }
            Command::MergeClock {
                sender,
                clock,
                reply,
            } => {
                let result = self.merge_clock(sender, &clock);
                self.finish(reply, result).await;
            }
            Command::RequestResource {
                device,
                resource,
                reply,
            } => {
                let result = self.request_resource(device, &resource).await;
                self.finish(reply, result).await;
            }
            Command::AcquireResource {
                device,
                resource,
                reply,
            } => {
                let result = self.acquire_resource(device, &resource).await;
                self.finish(reply, result).await;
            }
            Command::CancelRequest {
                device,
                resource,
                reply,
            } => {
                let result = self.cancel_request(device, &resource).await;
                self.finish(reply, result).await;
            }
            Command::ReleaseResource {
                device,
                resource,
                reply,
            } => {
                let result = self.release_resource(device, &resource).await;
                self.finish(reply, result).await;
            }
            Command::ResourceHolder { resource, reply } => {
                let result = self.mutex.holder(&resource).map_err(CoreError::from);
                self.finish(reply, result).await;
            }
            Command::Propose { value, reply } => {
                let result = self.propose(value).await;
                self.finish(reply, result).await;
            }
            Command::Vote { vote, reply } => {
                let result = self.vote(vote).await;
                self.finish(reply, result).await;
            }
            Command::ExpireProposal { proposal, reply } => {
                let result = self.expire(proposal).await;
                self.finish(reply, result).await;
            }
            Command::DetectFaulty { reply } => {
                let result = self.detect_faulty().await;
                self.finish(reply, result).await;
            }
            Command::Status { reply } => {
                let result = self.status().await;
                self.finish(reply, result).await;
            }
            Command::CreateCheckpoint { data, reply } => {
                let result = self.checkpoints().create(self.cluster.id, data).await;
                self.finish(reply, result).await;
            }
            Command::SnapshotCheckpoint { reply } => {
                let result = self.snapshot_checkpoint().await;
                self.finish(reply, result).await;
            }
            Command::Restore { id, reply } => {
                let result = self.checkpoints().restore(self.cluster.id, id).await;
                self.finish(reply, result).await;
            }
            Command::InitiateRecovery { reason, reply } => {
                let result = self.checkpoints().initiate_recovery(self.cluster.id, &reason).await;
                self.finish(reply, result).await;
            }
            Command::CompleteRecovery {
                id,
                success,
                details,
                reply,
            } => {
                let result = self.checkpoints().complete_recovery(id, success, &details).await;
                self.finish(reply, result).await;
            }
        }
        ControlFlow::Continue(())
    }

    /// Reply, resynchronizing first if the command hit corrupted state
    async fn finish<T>(&mut self, reply: Reply<T>, result: CoreResult<T>) {
        if let Err(CoreError::InvariantViolation { reason }) = &result {
            let reason = reason.clone();
            self.resync(&reason).await;
        }
        // the caller may have given up
        let _ = reply.send(result);
    }

    fn check_invariants(&self) -> CoreResult<()> {
        self.mutex.check()?;
        if let Some(leader) = self.cluster.leader
            && !self.members.contains(&leader)
        {
            return Err(CoreError::invariant(format!(
                "leader {leader} of {} is not a member",
                self.cluster.id
            )));
        }
        if self.cluster.member_count != self.members.len() {
            return Err(CoreError::invariant(format!(
                "{} caches {} members but has {}",
                self.cluster.id,
                self.cluster.member_count,
                self.members.len()
            )));
        }
        Ok(())
    }

    /// Drop in-flight state and re-elect
    async fn resync(&mut self, reason: &str) {
        let id = self.cluster.id;
        tracing::error!(cluster = %id, reason, "invariant violated, resynchronizing coordinator");
        self.audit(
            EventLogEntry::new(EventKind::InvariantViolation, id, reason).with_severity(Severity::Critical),
        )
        .await;

        self.abort_pending().await;
        self.mutex.clear();
        self.cluster.leader = None;
        self.cluster.member_count = self.members.len();
        if let Err(err) = self.ctx.write_cluster(&self.cluster).await {
            tracing::warn!(cluster = %id, error = %err, "could not persist cleared leader");
        }
        if let Err(err) = self.elect("resynchronization").await {
            tracing::warn!(cluster = %id, error = %err, "re-election after resync failed");
        }
    }

    /// Append to the audit log, stamped with the cluster clock unless the
    /// entry already carries a snapshot
    async fn audit(&self, entry: EventLogEntry) {
        let entry = match entry.clock {
            Some(_) => entry,
            None => entry.with_clock(self.clock.snapshot()),
        };
        emit(self.ctx.store.as_ref(), entry.with_cluster(self.cluster.id)).await;
    }

    /// Checkpoint manager whose audit entries carry the current clock
    fn checkpoints(&self) -> CheckpointManager {
        self.checkpoints.stamped(self.clock.snapshot())
    }

    async fn health(&self) -> CoreResult<HealthReport> {
        let devices = self.ctx.store.list_members(self.cluster.id).await?;
        Ok(HealthReport::build(
            &devices,
            Utc::now(),
            &self.ctx.config.health,
            &self.contradicted,
        ))
    }

    fn ensure_member(&self, device: DeviceId) -> CoreResult<()> {
        if !self.members.contains(&device) {
            return Err(CoreError::conflict(format!(
                "{device} is not a member of {}",
                self.cluster.id
            )));
        }
        if self.contradicted.contains(&device) {
            return Err(CoreError::conflict(format!("{device} is excluded as faulty")));
        }
        Ok(())
    }

    // membership

    async fn join(&mut self, device: DeviceId) -> CoreResult<Cluster> {
        let id = self.cluster.id;
        if self.members.contains(&device) {
            return Err(CoreError::conflict(format!("{device} is already a member of {id}")));
        }
        let mut previous = None;
        self.ctx
            .update_device(device, |record| match record.cluster {
                Some(other) if other != id => Err(CoreError::conflict(format!(
                    "{device} is already a member of {other}"
                ))),
                _ => {
                    previous = record.cluster;
                    record.cluster = Some(id);
                    Ok(())
                }
            })
            .await?;

        let mut next = self.cluster.clone();
        next.member_count = self.members.len() + 1;
        next.touch();
        if let Err(err) = self.ctx.write_cluster(&next).await {
            self.restore_device_cluster(device, previous).await;
            return Err(err);
        }
        self.cluster = next;
        self.members.insert(device);
        self.contradicted.remove(&device);
        self.reported_faulty.remove(&device);
        tracing::info!(cluster = %id, device = %device, members = self.members.len(), "member added");
        self.audit(
            EventLogEntry::new(EventKind::MemberAdded, device, format!("{device} joined"))
                .with_meta("members", self.members.len()),
        )
        .await;

        if self.cluster.leader.is_none()
            && let Err(err) = self.elect("member joined").await
        {
            tracing::warn!(cluster = %id, error = %err, "election after join failed");
        }
        Ok(self.cluster.clone())
    }

    async fn leave(&mut self, device: DeviceId) -> CoreResult<Cluster> {
        let id = self.cluster.id;
        if !self.members.contains(&device) {
            return Err(CoreError::conflict(format!("{device} is not a member of {id}")));
        }
        self.ctx
            .update_device(device, |record| {
                record.cluster = None;
                Ok(())
            })
            .await?;

        if self.members.len() == 1 {
            self.isolate(device).await;
            self.audit(
                EventLogEntry::new(EventKind::MemberRemoved, device, format!("{device} left"))
                    .with_meta("members", 0),
            )
            .await;
            return self.dissolve("last member left").await;
        }

        let was_leader = self.cluster.leader == Some(device);
        let mut next = self.cluster.clone();
        next.member_count = self.members.len() - 1;
        if was_leader {
            next.leader = None;
        }
        next.touch();
        if let Err(err) = self.ctx.write_cluster(&next).await {
            self.restore_device_cluster(device, Some(id)).await;
            return Err(err);
        }
        self.cluster = next;
        self.members.remove(&device);
        self.isolate(device).await;
        tracing::info!(cluster = %id, device = %device, members = self.members.len(), "member removed");
        self.audit(
            EventLogEntry::new(EventKind::MemberRemoved, device, format!("{device} left"))
                .with_meta("members", self.members.len()),
        )
        .await;

        if was_leader {
            self.audit_leader_lost(device, "leader left").await;
            if let Err(err) = self.reelect("leader left").await {
                tracing::warn!(cluster = %id, error = %err, "re-election after leader left failed");
            }
        }
        Ok(self.cluster.clone())
    }

    /// Undo a device record change after the cluster write failed
    async fn restore_device_cluster(&self, device: DeviceId, cluster: Option<ClusterId>) {
        let restored = self
            .ctx
            .update_device(device, |record| {
                record.cluster = cluster;
                Ok(())
            })
            .await;
        if let Err(err) = restored {
            tracing::error!(cluster = %self.cluster.id, device = %device, error = %err, "device record left inconsistent");
        }
    }

    async fn dissolve(&mut self, reason: &str) -> CoreResult<Cluster> {
        let id = self.cluster.id;
        let mut detached = Vec::with_capacity(self.members.len());
        for device in self.members.clone() {
            let result = self
                .ctx
                .update_device(device, |record| {
                    if record.cluster == Some(id) {
                        record.cluster = None;
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                self.reattach(&detached).await;
                return Err(err);
            }
            detached.push(device);
        }

        let mut next = self.cluster.clone();
        next.state = ClusterState::Dissolved;
        next.leader = None;
        next.member_count = 0;
        next.touch();
        if let Err(err) = self.ctx.write_cluster(&next).await {
            self.reattach(&detached).await;
            return Err(err);
        }
        self.cluster = next;
        self.members.clear();
        self.abort_pending().await;
        self.mutex.clear();
        tracing::info!(cluster = %id, reason, "cluster dissolved");
        self.audit(EventLogEntry::new(EventKind::ClusterDissolved, id, reason)).await;
        Ok(self.cluster.clone())
    }

    /// Rename the cluster or replace its settings. New clock retention
    /// applies at once; timeouts apply to the next election or request.
    async fn update(&mut self, name: Option<String>, settings: Option<ClusterSettings>) -> CoreResult<Cluster> {
        let id = self.cluster.id;
        let invalid = |field: &str, reason: &str| CoreError::Validation {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let mut next = self.cluster.clone();
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid("name", "must not be empty"));
            }
            next.name = name.to_string();
        }
        if let Some(settings) = settings {
            if settings.election_timeout_ms == 0 {
                return Err(invalid("election_timeout_ms", "must be positive"));
            }
            next.settings = settings;
        }
        next.touch();
        self.ctx.write_cluster(&next).await?;
        self.cluster = next;
        self.clock.set_settings(self.cluster.settings.vector_clock.clone());
        let pruned = self.clock.prune(&self.members, Utc::now());

        tracing::info!(cluster = %id, name = %self.cluster.name, pruned = pruned.len(), "cluster updated");
        self.audit(
            EventLogEntry::new(EventKind::ClusterUpdated, id, format!("cluster {} updated", self.cluster.name))
                .with_meta("name", self.cluster.name.clone())
                .with_meta("election_timeout_ms", self.cluster.settings.election_timeout_ms)
                .with_meta("clock_max_entries", self.cluster.settings.vector_clock.max_entries),
        )
        .await;
        Ok(self.cluster.clone())
    }

    /// Point detached members back at this cluster after a failed dissolve
    async fn reattach(&self, devices: &[DeviceId]) {
        for device in devices {
            self.restore_device_cluster(*device, Some(self.cluster.id)).await;
        }
    }

    async fn device_offline(&mut self, device: DeviceId) -> CoreResult<()> {
        if !self.members.contains(&device) {
            return Ok(());
        }
        self.isolate(device).await;
        if self.cluster.leader == Some(device) {
            self.leader_lost("leader went offline").await?;
        }
        Ok(())
    }

    /// Take a member out of every token queue and pending proposal
    async fn isolate(&mut self, device: DeviceId) {
        for (resource, holder) in self.mutex.evict(device) {
            tracing::info!(cluster = %self.cluster.id, resource = %resource, from = %device, "token reclaimed");
            self.audit(
                EventLogEntry::new(EventKind::ResourceReleased, device, format!("{resource} reclaimed"))
                    .with_meta("resource", resource.clone()),
            )
            .await;
            if let Some(holder) = holder {
                self.announce_grant(holder, &resource).await;
            }
        }
        for proposal in self.pending.values_mut() {
            proposal.exclude(&device);
        }
        self.settle().await;
    }

    // election

    /// Elect a leader among eligible members, retrying with a fresh term
    async fn elect(&mut self, reason: &str) -> CoreResult<LeaderAnnouncement> {
        let id = self.cluster.id;
        let policy = self.ctx.config.election.retry_policy();
        let timeout = Duration::from_millis(self.cluster.settings.election_timeout_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let eligible = self.health().await?.eligible();
            if eligible.is_empty() {
                return Err(ElectionError::NoMembers(id).into());
            }

            // every attempt consumes a term so no two rounds share one
            let term = self.cluster.term.next();
            self.cluster.term = term;
            self.cluster.leader = None;
            self.ctx.write_cluster(&self.cluster).await?;

            let clock = self.clock.snapshot();
            let candidates: Vec<Candidacy> = eligible
                .iter()
                .map(|device| Candidacy {
                    clock: clock.get(device),
                    device: *device,
                })
                .collect();

            match election::run_round(self.ctx.network.as_ref(), id, term, &candidates, timeout).await {
                RoundOutcome::Elected { winner, consents } => {
                    return self.install_leader(winner.device, term, consents, reason).await;
                }
                RoundOutcome::Stale(known) => {
                    tracing::debug!(cluster = %id, %term, %known, "peer reported a newer term");
                    self.cluster.term = self.cluster.term.max(known);
                }
                RoundOutcome::NoMajority => {
                    tracing::debug!(cluster = %id, %term, attempt, "no candidate reached a majority");
                }
            }

            if attempt >= policy.max_attempts {
                self.ctx.write_cluster(&self.cluster).await?;
                let err = ElectionError::ElectionTimeout {
                    term: self.cluster.term,
                    attempts: attempt,
                };
                tracing::warn!(cluster = %id, error = %err, "election failed");
                self.audit(
                    EventLogEntry::new(EventKind::ElectionFailed, id, err.to_string())
                        .with_meta("term", self.cluster.term.as_u64()),
                )
                .await;
                return Err(err.into());
            }
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }

    async fn install_leader(
        &mut self,
        leader: DeviceId,
        term: Term,
        consents: usize,
        reason: &str,
    ) -> CoreResult<LeaderAnnouncement> {
        let id = self.cluster.id;
        self.cluster.leader = Some(leader);
        if matches!(self.cluster.state, ClusterState::Forming | ClusterState::Degraded) {
            self.cluster.state = ClusterState::Active;
        }
        self.cluster.touch();
        self.ctx.write_cluster(&self.cluster).await?;

        tracing::info!(cluster = %id, leader = %leader, %term, consents, reason, "leader elected");
        self.audit(
            EventLogEntry::new(EventKind::LeaderElected, leader, format!("{leader} leads {term}"))
                .with_meta("term", term.as_u64())
                .with_meta("consents", consents)
                .with_meta("reason", reason),
        )
        .await;

        let announcement = LeaderAnnouncement {
            cluster: id,
            term,
            leader,
        };
        let timeout = Duration::from_millis(self.cluster.settings.election_timeout_ms);
        election::announce(
            self.ctx.network.as_ref(),
            self.members.clone(),
            announcement,
            timeout,
        )
        .await;
        Ok(announcement)
    }

    async fn leader_lost(&mut self, reason: &str) -> CoreResult<Option<LeaderAnnouncement>> {
        if let Some(old) = self.cluster.leader.take() {
            self.audit_leader_lost(old, reason).await;
        }
        self.reelect(reason).await
    }

    async fn audit_leader_lost(&self, old: DeviceId, reason: &str) {
        tracing::warn!(cluster = %self.cluster.id, leader = %old, reason, "leader lost");
        self.audit(
            EventLogEntry::new(EventKind::LeaderLost, old, reason)
                .with_meta("term", self.cluster.term.as_u64()),
        )
        .await;
    }

    /// Elect a replacement; with none available the cluster degrades
    async fn reelect(&mut self, reason: &str) -> CoreResult<Option<LeaderAnnouncement>> {
        let id = self.cluster.id;
        match self.elect(reason).await {
            Ok(announcement) => Ok(Some(announcement)),
            Err(err) => {
                self.cluster.state = ClusterState::Degraded;
                self.cluster.leader = None;
                self.ctx.write_cluster(&self.cluster).await?;
                tracing::warn!(cluster = %id, error = %err, "cluster degraded");
                self.audit(EventLogEntry::new(EventKind::ClusterDegraded, id, err.to_string())).await;
                if err.kind() == ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn claim_leadership(&mut self, device: DeviceId, term: Term) -> CoreResult<()> {
        let id = self.cluster.id;
        let current = self.cluster.term;
        if term < current {
            tracing::warn!(cluster = %id, device = %device, claimed = %term, %current, "stale leadership claim");
            self.audit(
                EventLogEntry::new(
                    EventKind::StaleLeaderRejected,
                    device,
                    format!("claim for {term} rejected"),
                )
                .with_meta("claimed", term.as_u64())
                .with_meta("current", current.as_u64()),
            )
            .await;
            // tell the stale claimant who leads now so it steps down
            if let Some(leader) = self.cluster.leader {
                let announcement = LeaderAnnouncement {
                    cluster: id,
                    term: current,
                    leader,
                };
                if let Err(err) = self.ctx.network.announce_leader(device, &announcement).await {
                    tracing::debug!(device = %device, error = %err, "could not fence stale leader");
                }
            }
            return Err(ElectionError::StaleTerm {
                claimed: term,
                current,
            }
            .into());
        }
        if term == current && self.cluster.leader == Some(device) {
            return Ok(());
        }
        Err(CoreError::conflict(format!("{device} is not the recognized leader for {term}")))
    }

    // vector clock

    /// Advance `device`'s entry, pruning departed devices if the clock outgrew its bound
    fn tick(&mut self, device: DeviceId) -> VectorClock {
        let now = Utc::now();
        let snapshot = self.clock.record(device, now);
        if self.clock.over_limit() {
            self.clock.prune(&self.members, now);
        }
        snapshot
    }

    async fn record_event(&mut self, device: DeviceId, message: String) -> CoreResult<VectorClock> {
        self.ensure_member(device)?;
        let now = Utc::now();
        let snapshot = self.tick(device);
        self.audit(
            EventLogEntry::new(EventKind::VectorClockUpdate, device, message)
                .with_clock(snapshot.clone())
                .with_timestamp(now),
        )
        .await;
        Ok(snapshot)
    }

    fn merge_clock(&mut self, sender: DeviceId, incoming: &VectorClock) -> CoreResult<VectorClock> {
        self.ensure_member(sender)?;
        Ok(self.clock.merge(sender, incoming, Utc::now()))
    }

    // mutual exclusion

    async fn request_resource(&mut self, device: DeviceId, resource: &str) -> CoreResult<MutexOutcome> {
        self.ensure_member(device)?;
        let already_held = self.mutex.holder(resource).ok().flatten() == Some(device);
        let snapshot = self.tick(device);
        let stamp = snapshot.weight();
        let outcome = self.mutex.request(device, resource, stamp);
        self.audit(
            EventLogEntry::new(EventKind::ResourceRequested, device, format!("{resource} requested"))
                .with_meta("resource", resource)
                .with_meta("timestamp", stamp)
                .with_clock(snapshot),
        )
        .await;
        match outcome {
            MutexOutcome::Granted if !already_held => self.announce_grant(device, resource).await,
            MutexOutcome::Queued { position } => {
                tracing::debug!(cluster = %self.cluster.id, resource, device = %device, position, "request queued");
            }
            MutexOutcome::Granted => {}
        }
        Ok(outcome)
    }

    async fn acquire_resource(&mut self, device: DeviceId, resource: &str) -> CoreResult<Acquisition> {
        match self.request_resource(device, resource).await? {
            MutexOutcome::Granted => Ok(Acquisition::Granted),
            MutexOutcome::Queued { .. } => Ok(Acquisition::Waiting {
                grant: self.mutex.wait(resource, device),
                timeout: Duration::from_millis(self.cluster.settings.mutual_exclusion.request_timeout_ms),
            }),
        }
    }

    async fn cancel_request(&mut self, device: DeviceId, resource: &str) -> CoreResult<()> {
        if let Withdrawal::Released(next) = self.mutex.cancel(device, resource)? {
            tracing::debug!(cluster = %self.cluster.id, resource, device = %device, "late grant revoked");
            if let Some(next) = next {
                self.announce_grant(next, resource).await;
            }
        }
        Ok(())
    }

    async fn release_resource(&mut self, device: DeviceId, resource: &str) -> CoreResult<Option<DeviceId>> {
        let next = self.mutex.release(device, resource)?;
        let snapshot = self.tick(device);
        self.audit(
            EventLogEntry::new(EventKind::ResourceReleased, device, format!("{resource} released"))
                .with_meta("resource", resource)
                .with_clock(snapshot),
        )
        .await;
        if let Some(next) = next {
            self.announce_grant(next, resource).await;
        }
        Ok(next)
    }

    async fn announce_grant(&mut self, device: DeviceId, resource: &str) {
        tracing::info!(cluster = %self.cluster.id, resource, holder = %device, "token granted");
        let snapshot = self.tick(device);
        self.audit(
            EventLogEntry::new(EventKind::ResourceGranted, device, format!("{resource} granted"))
                .with_meta("resource", resource)
                .with_clock(snapshot),
        )
        .await;
    }

    // agreement

    async fn propose(&mut self, value: serde_json::Value) -> CoreResult<Submitted> {
        let id = self.cluster.id;
        let eligible = self.health().await?.eligible();
        let n = self.members.len();
        let f = self.ctx.config.agreement.fault_tolerance;
        if n < 3 * f + 1 {
            tracing::warn!(cluster = %id, members = n, fault_tolerance = f, "too few members to mask f arbitrary faults");
        }
        let quorum = self.ctx.config.agreement.quorum_for(n);
        let timeout_ms = self.ctx.config.agreement.agreement_timeout_ms;
        let proposal = Proposal::new(id, value, eligible, quorum, timeout_ms);

        tracing::info!(cluster = %id, proposal = %proposal.id, quorum, voters = proposal.eligible.len(), "agreement proposed");
        self.audit(
            EventLogEntry::new(EventKind::AgreementProposed, id, format!("proposal {}", proposal.id))
                .with_meta("proposal", proposal.id.to_string())
                .with_meta("quorum", quorum)
                .with_meta("digest", proposal.digest.to_hex()),
        )
        .await;

        let (tx, decided) = oneshot::channel();
        self.waiters.insert(proposal.id, tx);
        self.pending.insert(proposal.id, proposal.clone());
        self.settle().await;
        Ok(Submitted {
            proposal,
            decided,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    async fn vote(&mut self, vote: Vote) -> CoreResult<VoteEffect> {
        if self.decided.contains_key(&vote.proposal) {
            return Ok(VoteEffect::Ignored);
        }
        let proposal = self
            .pending
            .get_mut(&vote.proposal)
            .ok_or(AgreementError::UnknownProposal(vote.proposal))?;
        let effect = proposal.apply(vote)?;
        if let VoteEffect::Equivocation(liar) = effect {
            self.mark_contradicted(liar).await;
        }
        self.settle().await;
        Ok(effect)
    }

    async fn mark_contradicted(&mut self, device: DeviceId) {
        let id = self.cluster.id;
        if !self.contradicted.insert(device) {
            return;
        }
        tracing::warn!(cluster = %id, device = %device, "member sent contradictory votes, marking faulty");
        self.audit(
            EventLogEntry::new(EventKind::FaultDetected, device, "contradictory votes")
                .with_severity(Severity::Error)
                .with_meta("reason", "equivocation"),
        )
        .await;
        self.reported_faulty.insert(device);
        self.isolate(device).await;
        if self.cluster.leader == Some(device)
            && let Err(err) = self.leader_lost("leader equivocated").await
        {
            tracing::warn!(cluster = %id, error = %err, "re-election after equivocation failed");
        }
    }

    async fn expire(&mut self, proposal: ProposalId) -> CoreResult<Proposal> {
        if let Some(pending) = self.pending.get_mut(&proposal) {
            pending.abort();
            self.settle().await;
        }
        self.decided
            .get(&proposal)
            .cloned()
            .ok_or_else(|| AgreementError::UnknownProposal(proposal).into())
    }

    async fn expire_overdue(&mut self) {
        let now = Utc::now();
        let mut expired = false;
        for proposal in self.pending.values_mut() {
            if proposal.deadline <= now {
                expired |= proposal.abort();
            }
        }
        if expired {
            self.settle().await;
        }
    }

    async fn abort_pending(&mut self) {
        for proposal in self.pending.values_mut() {
            proposal.abort();
        }
        self.settle().await;
    }

    /// Move final proposals out of the pending set and notify their waiters
    async fn settle(&mut self) {
        let finished: Vec<ProposalId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.is_final())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(proposal) = self.pending.remove(&id) {
                self.conclude(proposal).await;
            }
        }
    }

    async fn conclude(&mut self, proposal: Proposal) {
        let cluster = self.cluster.id;
        let (matching, quorum) = (proposal.matching(), proposal.quorum);
        let kind = if proposal.outcome == Outcome::Committed {
            self.agreed = Some(proposal.value.clone());
            tracing::info!(cluster = %cluster, proposal = %proposal.id, matching, quorum, "agreement committed");
            EventKind::AgreementCommitted
        } else {
            tracing::warn!(cluster = %cluster, proposal = %proposal.id, matching, quorum, "agreement aborted");
            EventKind::AgreementAborted
        };
        self.audit(
            EventLogEntry::new(kind, cluster, format!("proposal {}", proposal.id))
                .with_meta("proposal", proposal.id.to_string())
                .with_meta("matching", matching)
                .with_meta("quorum", quorum),
        )
        .await;

        if let Some(waiter) = self.waiters.remove(&proposal.id) {
            let _ = waiter.send(proposal.clone());
        }
        self.decided_order.push_back(proposal.id);
        self.decided.insert(proposal.id, proposal);
        while self.decided_order.len() > DECIDED_RETAINED {
            if let Some(oldest) = self.decided_order.pop_front() {
                self.decided.remove(&oldest);
            }
        }
    }

    // health

    async fn detect_faulty(&mut self) -> CoreResult<BTreeSet<DeviceId>> {
        let id = self.cluster.id;
        let report = self.health().await?;
        let newly: Vec<DeviceId> = report
            .faulty
            .difference(&self.reported_faulty)
            .copied()
            .collect();
        for device in newly {
            tracing::warn!(cluster = %id, device = %device, "member classified faulty");
            self.audit(
                EventLogEntry::new(EventKind::FaultDetected, device, "heartbeat expired or offline")
                    .with_severity(Severity::Warning),
            )
            .await;
            self.isolate(device).await;
        }
        for device in &report.suspect {
            tracing::debug!(cluster = %id, device = %device, "member suspect");
        }
        self.reported_faulty = report.faulty.clone();

        let pruned = self.clock.prune(&self.members, Utc::now());
        if !pruned.is_empty() {
            tracing::debug!(cluster = %id, pruned = pruned.len(), "clock entries pruned");
        }

        if let Some(leader) = self.cluster.leader
            && report.faulty.contains(&leader)
            && let Err(err) = self.leader_lost("leader faulty").await
        {
            tracing::warn!(cluster = %id, error = %err, "re-election after leader fault failed");
        }
        Ok(report.faulty)
    }

    async fn status(&self) -> CoreResult<ClusterStatus> {
        Ok(ClusterStatus {
            cluster: self.cluster.clone(),
            health: self.health().await?,
            held: self.mutex.held(),
            pending_proposals: self.pending.len(),
            latest_checkpoint: self.checkpoints.latest_sequence(self.cluster.id).await?,
            clock: self.clock.snapshot(),
        })
    }

    // checkpoints

    async fn snapshot_checkpoint(&mut self) -> CoreResult<Checkpoint> {
        let snapshot = ClusterSnapshot {
            cluster: self.cluster.id,
            term: self.cluster.term,
            leader: self.cluster.leader,
            members: self.health().await?.eligible(),
            clock: self.clock.snapshot(),
            agreed: self.agreed.clone(),
        };
        self.checkpoints().create(self.cluster.id, snapshot.encode()?).await
    }
}
