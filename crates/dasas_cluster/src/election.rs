//! Leader election.
//!
//! Ricart–Agrawala style: every eligible member stands with a candidacy
//! `(clock, device)`. A member consents to a candidate unless its own
//! candidacy is strictly lower. The lowest candidacy that collects consent
//! from a majority of the eligible members wins; unreachable members never
//! consent, so a partitioned minority cannot elect anyone.

use crate::network::PeerNetwork;
use dasas_core::{ClusterId, CoreError, DeviceId, Term};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Election errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    /// No member is eligible to lead
    #[error("cluster {0} has no electable members")]
    NoMembers(ClusterId),

    /// No candidate reached a majority in time
    #[error("election timed out in {term} after {attempts} attempts")]
    ElectionTimeout {
        /// Last term tried
        term: Term,
        /// Rounds run
        attempts: u32,
    },

    /// A leadership claim carries an outdated term
    #[error("stale leadership claim for {claimed}, current is {current}")]
    StaleTerm {
        /// Term in the claim
        claimed: Term,
        /// Cluster's current term
        current: Term,
    },
}

impl From<ElectionError> for CoreError {
    fn from(err: ElectionError) -> Self {
        match err {
            ElectionError::NoMembers(cluster) => CoreError::not_found("electable member", cluster),
            ElectionError::ElectionTimeout { .. } => CoreError::Timeout {
                operation: err.to_string(),
            },
            ElectionError::StaleTerm { .. } => CoreError::conflict(err.to_string()),
        }
    }
}

/// A timestamped candidacy; lower wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Candidacy {
    /// Candidate's logical clock
    pub clock: u64,
    /// Candidate; breaks ties between equal clocks
    pub device: DeviceId,
}

/// Consent request sent to one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub cluster: ClusterId,
    pub term: Term,
    pub candidate: Candidacy,
    /// The responder's own candidacy in this round, if it stands
    pub responder: Option<Candidacy>,
}

impl ConsentRequest {
    /// Reply of a correctly behaving member that last saw `known_term`
    #[must_use]
    pub fn honest_reply(&self, known_term: Term) -> ConsentReply {
        if known_term > self.term {
            return ConsentReply::StaleTerm { known: known_term };
        }
        match self.responder {
            Some(own) if own < self.candidate => ConsentReply::Defer,
            _ => ConsentReply::Consent,
        }
    }
}

/// Reply to a consent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentReply {
    /// Candidate may lead
    Consent,
    /// Responder holds a lower candidacy
    Defer,
    /// Responder has seen a newer term
    StaleTerm {
        /// Newest term the responder knows
        known: Term,
    },
}

/// New leader notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAnnouncement {
    pub cluster: ClusterId,
    pub term: Term,
    pub leader: DeviceId,
}

/// Result of one election round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A candidate collected a majority
    Elected {
        /// Winning candidacy
        winner: Candidacy,
        /// Consents received, own included
        consents: usize,
    },
    /// A member reported a newer term; retry above it
    Stale(Term),
    /// Nobody reached a majority before the deadline
    NoMajority,
}

/// Run one round among `candidates` (every eligible member).
///
/// Candidates are tried lowest first; the first to collect a majority wins.
/// Replies that arrive after `timeout` are dropped with their futures.
pub async fn run_round(
    network: &dyn PeerNetwork,
    cluster: ClusterId,
    term: Term,
    candidates: &[Candidacy],
    timeout: Duration,
) -> RoundOutcome {
    let mut ordered = candidates.to_vec();
    ordered.sort();
    let majority = ordered.len() / 2 + 1;

    let round = async {
        for candidate in &ordered {
            let requests = ordered
                .iter()
                .filter(|peer| peer.device != candidate.device)
                .map(|peer| {
                    let request = ConsentRequest {
                        cluster,
                        term,
                        candidate: *candidate,
                        responder: Some(*peer),
                    };
                    async move { network.request_consent(peer.device, &request).await }
                });

            let mut consents = 1;
            for reply in join_all(requests).await {
                match reply {
                    Ok(ConsentReply::Consent) => consents += 1,
                    Ok(ConsentReply::StaleTerm { known }) => return RoundOutcome::Stale(known),
                    Ok(ConsentReply::Defer) | Err(_) => {}
                }
            }
            tracing::debug!(
                cluster = %cluster,
                %term,
                candidate = %candidate.device,
                consents,
                majority,
                "candidacy tallied"
            );
            if consents >= majority {
                return RoundOutcome::Elected {
                    winner: *candidate,
                    consents,
                };
            }
        }
        RoundOutcome::NoMajority
    };

    tokio::time::timeout(timeout, round)
        .await
        .unwrap_or(RoundOutcome::NoMajority)
}

/// Tell every member about the new leader; failures only delay their view.
pub async fn announce(
    network: &dyn PeerNetwork,
    members: impl IntoIterator<Item = DeviceId>,
    announcement: LeaderAnnouncement,
    timeout: Duration,
) {
    let sends = members.into_iter().map(|member| async move {
        if let Err(err) = network.announce_leader(member, &announcement).await {
            tracing::debug!(member = %member, error = %err, "leader announcement not delivered");
        }
    });
    if tokio::time::timeout(timeout, join_all(sends)).await.is_err() {
        tracing::debug!(cluster = %announcement.cluster, "leader announcement timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerBehaviour, SimNetwork};

    fn candidacy(clock: u64, name: &str) -> Candidacy {
        Candidacy {
            clock,
            device: DeviceId::from_name(name),
        }
    }

    #[test]
    fn test_candidacy_order_uses_clock_then_id() {
        let a = candidacy(1, "a");
        let b = candidacy(2, "b");
        assert!(a < b);
        let (x, y) = (candidacy(5, "x"), candidacy(5, "y"));
        assert_eq!(x < y, x.device < y.device);
    }

    #[test]
    fn test_honest_reply() {
        let low = candidacy(1, "low");
        let high = candidacy(9, "high");
        let request = ConsentRequest {
            cluster: ClusterId::new(),
            term: Term::from_raw(3),
            candidate: high,
            responder: Some(low),
        };
        assert_eq!(request.honest_reply(Term::from_raw(3)), ConsentReply::Defer);
        assert_eq!(
            request.honest_reply(Term::from_raw(4)),
            ConsentReply::StaleTerm {
                known: Term::from_raw(4)
            }
        );
        let request = ConsentRequest {
            candidate: low,
            responder: Some(high),
            ..request
        };
        assert_eq!(request.honest_reply(Term::from_raw(1)), ConsentReply::Consent);
    }

    #[tokio::test]
    async fn test_lowest_candidacy_wins() {
        let network = SimNetwork::with_default(PeerBehaviour::Honest);
        let candidates = [candidacy(3, "c"), candidacy(1, "a"), candidacy(2, "b")];
        let outcome = run_round(
            &network,
            ClusterId::new(),
            Term::from_raw(1),
            &candidates,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(
            outcome,
            RoundOutcome::Elected {
                winner: candidacy(1, "a"),
                consents: 3
            }
        );
    }

    #[tokio::test]
    async fn test_partitioned_lowest_is_skipped() {
        let network = SimNetwork::with_default(PeerBehaviour::Honest);
        network
            .set_behaviour(DeviceId::from_name("a"), PeerBehaviour::Partitioned)
            .await;
        let candidates = [candidacy(1, "a"), candidacy(2, "b"), candidacy(3, "c")];
        let outcome = run_round(
            &network,
            ClusterId::new(),
            Term::from_raw(1),
            &candidates,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(outcome, RoundOutcome::Elected { winner, .. } if winner == candidacy(2, "b")));
    }

    #[tokio::test]
    async fn test_minority_cannot_elect() {
        let network = SimNetwork::with_default(PeerBehaviour::Crashed);
        let candidates = [candidacy(1, "a"), candidacy(2, "b"), candidacy(3, "c")];
        let outcome = run_round(
            &network,
            ClusterId::new(),
            Term::from_raw(1),
            &candidates,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, RoundOutcome::NoMajority);
    }

    #[tokio::test]
    async fn test_single_member_elects_itself() {
        let network = SimNetwork::new();
        let outcome = run_round(
            &network,
            ClusterId::new(),
            Term::from_raw(1),
            &[candidacy(0, "solo")],
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(outcome, RoundOutcome::Elected { consents: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_replies_are_dropped() {
        let network = SimNetwork::with_default(PeerBehaviour::Delayed(5_000));
        let candidates = [candidacy(1, "a"), candidacy(2, "b"), candidacy(3, "c")];
        let outcome = run_round(
            &network,
            ClusterId::new(),
            Term::from_raw(1),
            &candidates,
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(outcome, RoundOutcome::NoMajority);
    }

    #[tokio::test]
    async fn test_stale_term_reported() {
        let network = SimNetwork::with_default(PeerBehaviour::Honest);
        let cluster = ClusterId::new();
        let b = DeviceId::from_name("b");
        network
            .announce_leader(
                b,
                &LeaderAnnouncement {
                    cluster,
                    term: Term::from_raw(7),
                    leader: b,
                },
            )
            .await
            .unwrap();
        let candidates = [candidacy(1, "a"), candidacy(2, "b")];
        let outcome = run_round(&network, cluster, Term::from_raw(2), &candidates, Duration::from_secs(1)).await;
        assert_eq!(outcome, RoundOutcome::Stale(Term::from_raw(7)));
    }
}
