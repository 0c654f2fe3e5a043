//! DASAS Core Types
//!
//! Pure types shared by every DASAS crate: identifiers, the error taxonomy,
//! terms and wall-clock helpers, checkpoint digests and the device/cluster
//! records kept by the membership store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod hash;
pub mod id;
pub mod model;
pub mod retry;
pub mod time;

// Re-exports
pub use clock::{CausalOrder, VectorClock};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use hash::Hash;
pub use id::{CheckpointId, ClusterId, DeviceId, EventId, IdParseError, ProposalId, RecoveryId};
pub use model::{
    Cluster, ClusterSettings, ClusterState, Device, DeviceStatus, MutexSettings,
    VectorClockSettings,
};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use time::{Term, elapsed_ms};
