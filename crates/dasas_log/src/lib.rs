//! DASAS Event Log
//!
//! Append-only records of coordination events (elections, membership
//! changes, token traffic, agreements, checkpoints and recoveries), the
//! audit sink the engine writes them to, and the causal history cursor used
//! to read them back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod history;
pub mod sink;

pub use event::{EventKind, EventLogEntry, Severity};
pub use history::CausalHistory;
pub use sink::{AuditSink, EventHistory, LogError, emit};
