//! Core error types for DASAS.
//!
//! Every operation exposed by the coordination engine reports one of these
//! variants. Component errors (`ElectionError`, `MutexError`, ...) convert into
//! `CoreError` without losing their place in the taxonomy.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Broad classification of a [`CoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown cluster, device, checkpoint, proposal or resource
    NotFound,
    /// Duplicate membership, not-holder release, stale-term claim
    Conflict,
    /// A protocol deadline elapsed
    Timeout,
    /// Agreement aborted without a quorum
    QuorumNotReached,
    /// Durable store failure
    Storage,
    /// Internal inconsistency, always fatal for the cluster coordinator
    InvariantViolation,
    /// Invalid input or configuration
    Validation,
    /// The coordinator is shutting down
    Cancelled,
}

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Conflicting request
    #[error("Conflict: {reason}")]
    Conflict {
        /// What conflicted
        reason: String,
    },

    /// Timeout
    #[error("Timeout: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Quorum not reached
    #[error("Quorum not reached: {have}/{needed} matching votes")]
    QuorumNotReached {
        /// Matching votes collected
        have: usize,
        /// Votes required
        needed: usize,
    },

    /// Storage failure
    #[error("Storage error: {reason}")]
    Storage {
        /// Underlying failure
        reason: String,
    },

    /// Internal invariant broken
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        /// Which invariant was broken
        reason: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Shorthand for a not-found error
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a conflict
    #[must_use]
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Shorthand for a storage failure
    #[must_use]
    pub fn storage(reason: impl ToString) -> Self {
        Self::Storage {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an invariant violation
    #[must_use]
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::QuorumNotReached { .. } => ErrorKind::QuorumNotReached,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a caller may retry the failed step locally
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage | ErrorKind::Timeout)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            field: "encoding".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found("Cluster", "cluster_123");
        assert_eq!(format!("{}", err), "Cluster not found: cluster_123");

        let err = CoreError::QuorumNotReached { have: 1, needed: 2 };
        assert_eq!(format!("{}", err), "Quorum not reached: 1/2 matching votes");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(CoreError::conflict("dup").kind(), ErrorKind::Conflict);
        assert_eq!(CoreError::storage("disk").kind(), ErrorKind::Storage);
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_retryable() {
        assert!(CoreError::storage("io").is_retryable());
        assert!(CoreError::Timeout { operation: "vote".into() }.is_retryable());
        assert!(!CoreError::conflict("not holder").is_retryable());
        assert!(!CoreError::invariant("two holders").is_retryable());
    }
}
