//! Agreement among non-faulty members.
//!
//! A proposal commits once `quorum` members accept the same value digest and
//! aborts as soon as that count can no longer be reached, or when its
//! deadline passes. Either outcome is final. A member whose relayed votes
//! disagree is dropped from the proposal and reported as faulty.

use chrono::{DateTime, Duration, Utc};
use dasas_core::{ClusterId, CoreError, DeviceId, Hash, ProposalId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Agreement errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgreementError {
    /// No such proposal in this cluster
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    /// Voter is not an eligible member for the proposal
    #[error("{voter} may not vote on {proposal}")]
    NotEligible {
        /// Rejected voter
        voter: DeviceId,
        /// Proposal
        proposal: ProposalId,
    },
}

impl From<AgreementError> for CoreError {
    fn from(err: AgreementError) -> Self {
        match err {
            AgreementError::UnknownProposal(id) => CoreError::not_found("proposal", id),
            AgreementError::NotEligible { .. } => CoreError::conflict(err.to_string()),
        }
    }
}

/// Proposal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Still collecting votes
    Pending,
    /// Quorum of matching accepts reached
    Committed,
    /// Quorum no longer reachable, or aborted while pending
    Aborted,
}

/// What peers are asked to vote on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub proposal: ProposalId,
    pub cluster: ClusterId,
    /// Hash of the proposed value
    pub digest: Hash,
}

/// One member's vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal: ProposalId,
    pub voter: DeviceId,
    /// Digest of the value the voter saw
    pub value: Hash,
    /// False for a reject
    pub accept: bool,
}

/// Effect of applying a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteEffect {
    /// Counted
    Recorded,
    /// Same vote seen before
    Duplicate,
    /// Conflicting votes from this voter; it no longer counts
    Equivocation(DeviceId),
    /// Outcome already final
    Ignored,
}

/// Digest of a proposed value
#[must_use]
pub fn digest_of(value: &serde_json::Value) -> Hash {
    Hash::compute(value.to_string().as_bytes())
}

/// An agreement proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub cluster: ClusterId,
    pub value: serde_json::Value,
    /// Hash of `value` that accepting votes must match
    pub digest: Hash,
    /// Counted vote per voter
    pub votes: BTreeMap<DeviceId, Vote>,
    /// Members whose votes count
    pub eligible: BTreeSet<DeviceId>,
    /// Matching accepts needed to commit
    pub quorum: usize,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
    /// Aborted if still pending at this time
    pub deadline: DateTime<Utc>,
}

impl Proposal {
    /// Open a proposal
    #[must_use]
    pub fn new(
        cluster: ClusterId,
        value: serde_json::Value,
        eligible: BTreeSet<DeviceId>,
        quorum: usize,
        timeout_ms: u64,
    ) -> Self {
        let created_at = Utc::now();
        let timeout = Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX));
        let mut proposal = Self {
            id: ProposalId::new(),
            cluster,
            digest: digest_of(&value),
            value,
            votes: BTreeMap::new(),
            eligible,
            quorum,
            outcome: Outcome::Pending,
            created_at,
            deadline: created_at + timeout,
        };
        proposal.evaluate();
        proposal
    }

    /// Ballot sent to peers
    #[must_use]
    pub fn ballot(&self) -> Ballot {
        Ballot {
            proposal: self.id,
            cluster: self.cluster,
            digest: self.digest,
        }
    }

    /// Accepting votes for this proposal's value
    #[must_use]
    pub fn matching(&self) -> usize {
        self.votes
            .values()
            .filter(|v| v.accept && v.value == self.digest)
            .count()
    }

    /// Eligible members that have not voted yet
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.eligible
            .iter()
            .filter(|d| !self.votes.contains_key(d))
            .count()
    }

    /// Whether the outcome is final
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.outcome != Outcome::Pending
    }

    /// Apply a vote
    ///
    /// # Errors
    ///
    /// Returns `AgreementError::NotEligible` if the voter is not eligible
    /// and the proposal is still pending
    pub fn apply(&mut self, vote: Vote) -> Result<VoteEffect, AgreementError> {
        if self.is_final() {
            return Ok(VoteEffect::Ignored);
        }
        if !self.eligible.contains(&vote.voter) {
            return Err(AgreementError::NotEligible {
                voter: vote.voter,
                proposal: self.id,
            });
        }
        let effect = match self.votes.get(&vote.voter) {
            Some(prior) if prior.value == vote.value && prior.accept == vote.accept => {
                VoteEffect::Duplicate
            }
            Some(_) => {
                self.votes.remove(&vote.voter);
                self.eligible.remove(&vote.voter);
                VoteEffect::Equivocation(vote.voter)
            }
            None => {
                self.votes.insert(vote.voter, vote);
                VoteEffect::Recorded
            }
        };
        self.evaluate();
        Ok(effect)
    }

    /// Stop counting a member (left the cluster or turned faulty)
    pub fn exclude(&mut self, device: &DeviceId) {
        if self.is_final() {
            return;
        }
        self.votes.remove(device);
        self.eligible.remove(device);
        self.evaluate();
    }

    /// Abort if still pending; returns whether this call aborted it
    pub fn abort(&mut self) -> bool {
        if self.is_final() {
            return false;
        }
        self.outcome = Outcome::Aborted;
        true
    }

    fn evaluate(&mut self) {
        if self.is_final() {
            return;
        }
        let matching = self.matching();
        if matching >= self.quorum {
            self.outcome = Outcome::Committed;
        } else if matching + self.outstanding() < self.quorum {
            self.outcome = Outcome::Aborted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn members(names: &[&str]) -> BTreeSet<DeviceId> {
        names.iter().map(|n| DeviceId::from_name(n)).collect()
    }

    fn vote(proposal: &Proposal, name: &str, accept: bool) -> Vote {
        Vote {
            proposal: proposal.id,
            voter: DeviceId::from_name(name),
            value: proposal.digest,
            accept,
        }
    }

    #[test]
    fn test_commit_on_quorum() {
        let mut p = Proposal::new(ClusterId::new(), json!("V1"), members(&["a", "b", "c"]), 2, 1_000);
        assert_eq!(p.apply(vote(&p, "a", true)), Ok(VoteEffect::Recorded));
        assert_eq!(p.outcome, Outcome::Pending);
        p.apply(vote(&p, "b", true)).unwrap();
        assert_eq!(p.outcome, Outcome::Committed);
        assert_eq!(p.value, json!("V1"));
    }

    #[test]
    fn test_commit_is_final() {
        let mut p = Proposal::new(ClusterId::new(), json!(1), members(&["a", "b", "c"]), 2, 1_000);
        p.apply(vote(&p, "a", true)).unwrap();
        p.apply(vote(&p, "b", true)).unwrap();
        assert_eq!(p.apply(vote(&p, "c", false)), Ok(VoteEffect::Ignored));
        assert_eq!(p.apply(vote(&p, "a", false)), Ok(VoteEffect::Ignored));
        assert!(!p.abort());
        p.exclude(&DeviceId::from_name("a"));
        assert_eq!(p.outcome, Outcome::Committed);
    }

    #[test]
    fn test_abort_when_quorum_impossible() {
        let mut p = Proposal::new(ClusterId::new(), json!(1), members(&["a", "b", "c"]), 2, 1_000);
        p.apply(vote(&p, "a", false)).unwrap();
        assert_eq!(p.outcome, Outcome::Pending);
        p.apply(vote(&p, "b", false)).unwrap();
        assert_eq!(p.outcome, Outcome::Aborted);
    }

    #[test]
    fn test_mismatched_value_does_not_count() {
        let mut p = Proposal::new(ClusterId::new(), json!("x"), members(&["a", "b"]), 2, 1_000);
        let mut wrong = vote(&p, "a", true);
        wrong.value = digest_of(&json!("y"));
        p.apply(wrong).unwrap();
        assert_eq!(p.matching(), 0);
        assert_eq!(p.outcome, Outcome::Aborted);
    }

    #[test]
    fn test_equivocation_excludes_voter() {
        let mut p = Proposal::new(
            ClusterId::new(),
            json!("v"),
            members(&["a", "b", "c", "d"]),
            3,
            1_000,
        );
        let liar = DeviceId::from_name("d");
        p.apply(vote(&p, "d", true)).unwrap();
        let mut other = vote(&p, "d", true);
        other.value = digest_of(&json!("w"));
        assert_eq!(p.apply(other), Ok(VoteEffect::Equivocation(liar)));
        assert!(!p.eligible.contains(&liar));
        assert_eq!(
            p.apply(vote(&p, "d", true)),
            Err(AgreementError::NotEligible {
                voter: liar,
                proposal: p.id
            })
        );

        p.apply(vote(&p, "a", true)).unwrap();
        p.apply(vote(&p, "b", true)).unwrap();
        assert_eq!(p.outcome, Outcome::Pending);
        p.apply(vote(&p, "c", true)).unwrap();
        assert_eq!(p.outcome, Outcome::Committed);
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let mut p = Proposal::new(ClusterId::new(), json!(1), members(&["a", "b", "c"]), 3, 1_000);
        p.apply(vote(&p, "a", true)).unwrap();
        assert_eq!(p.apply(vote(&p, "a", true)), Ok(VoteEffect::Duplicate));
        assert_eq!(p.matching(), 1);
    }

    #[test]
    fn test_unreachable_quorum_aborts_immediately() {
        let p = Proposal::new(ClusterId::new(), json!(1), members(&["a"]), 2, 1_000);
        assert_eq!(p.outcome, Outcome::Aborted);
    }

    #[test]
    fn test_exclude_can_abort() {
        let mut p = Proposal::new(ClusterId::new(), json!(1), members(&["a", "b"]), 2, 1_000);
        p.exclude(&DeviceId::from_name("b"));
        assert_eq!(p.outcome, Outcome::Aborted);
    }
}
