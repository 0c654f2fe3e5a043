//! Audit sink and history traits.

use crate::event::EventLogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dasas_core::{ClusterId, CoreError};

/// Log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// The backing store rejected the write or read
    #[error("event log unavailable: {reason}")]
    Unavailable {
        /// Underlying failure
        reason: String,
    },
}

impl From<LogError> for CoreError {
    fn from(err: LogError) -> Self {
        CoreError::storage(err)
    }
}

/// Where the engine writes audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one entry
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the entry could not be stored
    async fn append(&self, entry: EventLogEntry) -> Result<(), LogError>;
}

/// Read side of the audit log
#[async_trait]
pub trait EventHistory: Send + Sync {
    /// Entries recorded for `cluster`, optionally only those at or after `since`
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the backing store cannot be read
    async fn entries_for(
        &self,
        cluster: ClusterId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventLogEntry>, LogError>;
}

/// Append to a sink without propagating failure.
///
/// Audit loss must never block coordination, so a failed append is only
/// logged.
pub async fn emit<S: AuditSink + ?Sized>(sink: &S, entry: EventLogEntry) {
    let kind = entry.kind;
    if let Err(err) = sink.append(entry).await {
        tracing::warn!(event = %kind, error = %err, "dropping audit event");
    }
}
