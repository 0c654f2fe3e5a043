//! Peer communication.
//!
//! The coordinator reaches members only through [`PeerNetwork`]. Wire
//! transports are out of scope; [`SimNetwork`] is an in-process mesh with
//! per-device fault behaviour for tests and demos.

use crate::agreement::{Ballot, Vote};
use crate::election::{ConsentReply, ConsentRequest, LeaderAnnouncement};
use async_trait::async_trait;
use dasas_core::{ClusterId, DeviceId, Hash, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The peer (or the sender) cannot be reached
    #[error("peer unreachable: {0}")]
    Unreachable(DeviceId),
}

/// How the coordinator talks to members
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Ask `to` to consent to a candidacy
    async fn request_consent(
        &self,
        to: DeviceId,
        request: &ConsentRequest,
    ) -> Result<ConsentReply, NetworkError>;

    /// Tell `to` who leads in which term
    async fn announce_leader(
        &self,
        to: DeviceId,
        announcement: &LeaderAnnouncement,
    ) -> Result<(), NetworkError>;

    /// Ask `to` to vote on a ballot.
    ///
    /// Returns every copy of `to`'s vote relayed back to the coordinator. A
    /// correct member's copies are identical; differing copies expose an
    /// equivocating voter.
    async fn request_vote(&self, to: DeviceId, ballot: &Ballot) -> Result<Vec<Vote>, NetworkError>;
}

/// Simulated member behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerBehaviour {
    /// Follows the protocol
    Honest,
    /// Stopped responding
    Crashed,
    /// Cut off until healed
    Partitioned,
    /// Sends different votes to different peers
    Equivocating,
    /// Refuses every consent and vote
    Rejecting,
    /// Honest, but every reply takes this many milliseconds
    Delayed(u64),
}

impl PeerBehaviour {
    fn reachable(self) -> bool {
        !matches!(self, Self::Crashed | Self::Partitioned)
    }
}

/// What a simulated member believes about a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    /// Highest term observed
    pub term: Term,
    /// Leader for that term
    pub leader: Option<DeviceId>,
}

#[derive(Debug, Clone)]
struct SimPeer {
    behaviour: PeerBehaviour,
    views: HashMap<ClusterId, PeerView>,
}

impl SimPeer {
    fn new(behaviour: PeerBehaviour) -> Self {
        Self {
            behaviour,
            views: HashMap::new(),
        }
    }

    fn known_term(&self, cluster: ClusterId) -> Term {
        self.views.get(&cluster).map_or(Term::zero(), |v| v.term)
    }
}

/// In-process mesh
#[derive(Debug, Clone)]
pub struct SimNetwork {
    peers: Arc<RwLock<HashMap<DeviceId, SimPeer>>>,
    /// Behaviour of devices never configured; `None` makes them unreachable
    default: Option<PeerBehaviour>,
}

impl SimNetwork {
    /// Create a mesh where unconfigured devices are unreachable
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            default: None,
        }
    }

    /// Create a mesh where unconfigured devices behave as `behaviour`
    #[must_use]
    pub fn with_default(behaviour: PeerBehaviour) -> Self {
        Self {
            default: Some(behaviour),
            ..Self::new()
        }
    }

    /// Set one device's behaviour
    pub async fn set_behaviour(&self, device: DeviceId, behaviour: PeerBehaviour) {
        let mut peers = self.peers.write().await;
        peers
            .entry(device)
            .and_modify(|p| p.behaviour = behaviour)
            .or_insert_with(|| SimPeer::new(behaviour));
    }

    /// Cut devices off
    pub async fn partition(&self, devices: impl IntoIterator<Item = DeviceId>) {
        for device in devices {
            self.set_behaviour(device, PeerBehaviour::Partitioned).await;
        }
    }

    /// Reconnect every partitioned device
    pub async fn heal(&self) {
        let mut peers = self.peers.write().await;
        for peer in peers.values_mut() {
            if peer.behaviour == PeerBehaviour::Partitioned {
                peer.behaviour = PeerBehaviour::Honest;
            }
        }
    }

    /// A device's view of a cluster's leadership
    pub async fn view(&self, device: DeviceId, cluster: ClusterId) -> Option<PeerView> {
        let peers = self.peers.read().await;
        peers.get(&device).and_then(|p| p.views.get(&cluster).copied())
    }

    async fn behaviour(&self, device: DeviceId) -> Option<PeerBehaviour> {
        let peers = self.peers.read().await;
        peers.get(&device).map(|p| p.behaviour).or(self.default)
    }

    /// Resolve the target's behaviour, failing if either endpoint is cut off
    async fn route(&self, from: Option<DeviceId>, to: DeviceId) -> Result<PeerBehaviour, NetworkError> {
        if let Some(from) = from
            && let Some(sender) = self.behaviour(from).await
            && !sender.reachable()
        {
            return Err(NetworkError::Unreachable(from));
        }
        let behaviour = self
            .behaviour(to)
            .await
            .filter(|b| b.reachable())
            .ok_or(NetworkError::Unreachable(to))?;
        if let PeerBehaviour::Delayed(ms) = behaviour {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(behaviour)
    }

    async fn peer_term(&self, device: DeviceId, cluster: ClusterId) -> Term {
        let peers = self.peers.read().await;
        peers
            .get(&device)
            .map_or(Term::zero(), |p| p.known_term(cluster))
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerNetwork for SimNetwork {
    async fn request_consent(
        &self,
        to: DeviceId,
        request: &ConsentRequest,
    ) -> Result<ConsentReply, NetworkError> {
        let behaviour = self.route(Some(request.candidate.device), to).await?;
        if behaviour == PeerBehaviour::Rejecting {
            return Ok(ConsentReply::Defer);
        }
        let known = self.peer_term(to, request.cluster).await;
        Ok(request.honest_reply(known))
    }

    async fn announce_leader(
        &self,
        to: DeviceId,
        announcement: &LeaderAnnouncement,
    ) -> Result<(), NetworkError> {
        let behaviour = self.route(None, to).await?;
        let mut peers = self.peers.write().await;
        let peer = peers.entry(to).or_insert_with(|| SimPeer::new(behaviour));
        let view = peer.views.entry(announcement.cluster).or_insert(PeerView {
            term: Term::zero(),
            leader: None,
        });
        if announcement.term >= view.term {
            if view.leader == Some(to) && announcement.leader != to {
                tracing::debug!(device = %to, term = %announcement.term, "stale leader stepping down");
            }
            *view = PeerView {
                term: announcement.term,
                leader: Some(announcement.leader),
            };
        }
        Ok(())
    }

    async fn request_vote(&self, to: DeviceId, ballot: &Ballot) -> Result<Vec<Vote>, NetworkError> {
        let behaviour = self.route(None, to).await?;
        let vote = |value: Hash, accept: bool| Vote {
            proposal: ballot.proposal,
            voter: to,
            value,
            accept,
        };
        Ok(match behaviour {
            PeerBehaviour::Rejecting => vec![vote(ballot.digest, false)],
            PeerBehaviour::Equivocating => vec![
                vote(ballot.digest, true),
                vote(Hash::compute(to.to_string().as_bytes()), true),
            ],
            _ => vec![vote(ballot.digest, true)],
        })
    }
}
