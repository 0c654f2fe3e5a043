//! Engine configuration.
//!
//! Loaded once at startup. Per-cluster settings start from
//! `cluster_defaults` and are stored on the cluster record.

use dasas_core::{ClusterSettings, CoreError, CoreResult, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Election retry parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Attempts after the first one that timed out
    pub max_retries: u32,
    /// Backoff before the first retry
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff
    pub backoff_max_ms: u64,
}

impl ElectionConfig {
    /// Retry policy for election rounds
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries + 1, self.backoff_base_ms, self.backoff_max_ms)
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

/// Heartbeat age thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Past this age a member is suspect
    pub soft_timeout_ms: u64,
    /// Past this age a member is faulty
    pub hard_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            soft_timeout_ms: 30_000,
            hard_timeout_ms: 60_000,
        }
    }
}

/// Agreement parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// Tolerated arbitrary-behaving members (`f`)
    pub fault_tolerance: usize,
    /// Fixed quorum; `None` means `ceil((n + f) / 2)`
    pub quorum_size: Option<usize>,
    /// Time to collect votes
    pub agreement_timeout_ms: u64,
}

impl AgreementConfig {
    /// Matching votes required among `members` members.
    ///
    /// Never at or below the fault tolerance, so `f` faulty members alone
    /// cannot commit.
    #[must_use]
    pub fn quorum_for(&self, members: usize) -> usize {
        let f = self.fault_tolerance;
        let quorum = self.quorum_size.unwrap_or_else(|| (members + f).div_ceil(2));
        quorum.max(f + 1)
    }
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: 1,
            quorum_size: None,
            agreement_timeout_ms: 10_000,
        }
    }
}

/// Checkpoint scheduling and retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Seconds between scheduled checkpoints
    pub interval_secs: u64,
    /// Checkpoints kept per cluster
    pub retention_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            retention_count: 24,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Most recent audit entries a causal history query orders
    pub history_limit: usize,
    /// Settings given to new clusters
    pub cluster_defaults: ClusterSettings,
    /// Election retries
    pub election: ElectionConfig,
    /// Fault detection thresholds
    pub health: HealthConfig,
    /// Agreement parameters
    pub agreement: AgreementConfig,
    /// Checkpointing
    pub checkpoint: CheckpointConfig,
    /// Retry policy for store writes
    pub storage_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            cluster_defaults: ClusterSettings::default(),
            election: ElectionConfig::default(),
            health: HealthConfig::default(),
            agreement: AgreementConfig::default(),
            checkpoint: CheckpointConfig::default(),
            storage_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set fault tolerance
    #[must_use]
    pub fn with_fault_tolerance(mut self, f: usize) -> Self {
        self.agreement.fault_tolerance = f;
        self
    }

    /// Set a fixed quorum size
    #[must_use]
    pub fn with_quorum_size(mut self, quorum: usize) -> Self {
        self.agreement.quorum_size = Some(quorum);
        self
    }

    /// Set agreement timeout
    #[must_use]
    pub fn with_agreement_timeout(mut self, timeout_ms: u64) -> Self {
        self.agreement.agreement_timeout_ms = timeout_ms;
        self
    }

    /// Set heartbeat thresholds
    #[must_use]
    pub fn with_health(mut self, soft_timeout_ms: u64, hard_timeout_ms: u64) -> Self {
        self.health = HealthConfig {
            soft_timeout_ms,
            hard_timeout_ms,
        };
        self
    }

    /// Set checkpoint retention
    #[must_use]
    pub fn with_retention(mut self, count: usize) -> Self {
        self.checkpoint.retention_count = count;
        self
    }

    /// Cap causal history queries
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set default cluster settings
    #[must_use]
    pub fn with_cluster_defaults(mut self, settings: ClusterSettings) -> Self {
        self.cluster_defaults = settings;
        self
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` naming the first offending field
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |field: &str, reason: String| CoreError::Validation {
            field: field.to_string(),
            reason,
        };
        if self.health.hard_timeout_ms <= self.health.soft_timeout_ms {
            return Err(invalid(
                "health.hard_timeout_ms",
                format!(
                    "must exceed soft timeout ({} <= {})",
                    self.health.hard_timeout_ms, self.health.soft_timeout_ms
                ),
            ));
        }
        if let Some(quorum) = self.agreement.quorum_size
            && quorum <= self.agreement.fault_tolerance
        {
            return Err(invalid(
                "agreement.quorum_size",
                format!(
                    "must exceed fault tolerance ({quorum} <= {})",
                    self.agreement.fault_tolerance
                ),
            ));
        }
        if self.cluster_defaults.election_timeout_ms == 0 {
            return Err(invalid("cluster_defaults.election_timeout_ms", "must be positive".into()));
        }
        if self.agreement.agreement_timeout_ms == 0 {
            return Err(invalid("agreement.agreement_timeout_ms", "must be positive".into()));
        }
        if self.checkpoint.retention_count == 0 {
            return Err(invalid("checkpoint.retention_count", "must keep at least one".into()));
        }
        if self.history_limit == 0 {
            return Err(invalid("history_limit", "must be positive".into()));
        }
        Ok(())
    }
}
