//! DASAS Cluster
//!
//! Coordination and fault tolerance for clusters of cooperating devices.
//! Leader election, token-based mutual exclusion, vector clocks, quorum
//! agreement with equivocation detection, checkpoints and recovery.
//!
//! Each cluster is driven by its own coordinator task; [`CoordinationEngine`]
//! routes calls to it and [`Scheduler`] runs periodic maintenance.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agreement;
pub mod checkpoint;
pub mod config;
mod coordinator;
pub mod election;
pub mod engine;
pub mod health;
pub mod mutex;
pub mod network;
pub mod scheduler;
pub mod vclock;

pub use agreement::{AgreementError, Ballot, Outcome, Proposal, Vote, VoteEffect, digest_of};
pub use checkpoint::{CheckpointError, CheckpointManager, ClusterSnapshot};
pub use config::{AgreementConfig, CheckpointConfig, ElectionConfig, EngineConfig, HealthConfig};
pub use coordinator::ClusterStatus;
pub use election::{ElectionError, LeaderAnnouncement};
pub use engine::CoordinationEngine;
pub use health::{HealthReport, HealthStatus};
pub use mutex::{MutexCoordinator, MutexError, MutexOutcome, ResourceToken};
pub use network::{NetworkError, PeerBehaviour, PeerNetwork, PeerView, SimNetwork};
pub use scheduler::Scheduler;
pub use vclock::ClockService;
