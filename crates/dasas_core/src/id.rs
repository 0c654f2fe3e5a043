//! Unique identifiers for DASAS entities.
//!
//! All IDs are UUIDs. They display with a short type prefix (`dev_…`,
//! `cluster_…`) and parse from either the prefixed or the bare form.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Error parsing an identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {input}")]
pub struct IdParseError {
    /// Kind of id that was expected
    pub kind: &'static str,
    /// Rejected input
    pub input: String,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Create from a name (stable across processes)
            #[must_use]
            pub fn from_name(name: &str) -> Self {
                Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Uuid::parse_str(raw).map(Self).map_err(|_| IdParseError {
                    kind: $prefix,
                    input: s.to_string(),
                })
            }
        }
    };
}

define_id!(
    /// Cluster identifier
    ClusterId,
    "cluster"
);
define_id!(
    /// Device identifier - one Android device in the mesh
    DeviceId,
    "dev"
);
define_id!(
    /// Checkpoint identifier
    CheckpointId,
    "ckpt"
);
define_id!(
    /// Agreement proposal identifier
    ProposalId,
    "prop"
);
define_id!(
    /// Recovery attempt identifier
    RecoveryId,
    "rec"
);
define_id!(
    /// Event log entry identifier
    EventId,
    "evt"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        assert_ne!(ClusterId::new(), ClusterId::new());
        assert_ne!(DeviceId::new(), DeviceId::new());
    }

    #[test]
    fn test_id_display() {
        let id = DeviceId::new();
        assert!(id.to_string().starts_with("dev_"));
        let id = CheckpointId::new();
        assert!(id.to_string().starts_with("ckpt_"));
    }

    #[test]
    fn test_id_parse_roundtrip() {
        let id = ClusterId::new();
        assert_eq!(id.to_string().parse::<ClusterId>().unwrap(), id);
        assert_eq!(id.as_uuid().to_string().parse::<ClusterId>().unwrap(), id);
        assert!("cluster_nope".parse::<ClusterId>().is_err());
    }

    #[test]
    fn test_device_id_from_name() {
        assert_eq!(DeviceId::from_name("pixel-7"), DeviceId::from_name("pixel-7"));
        assert_ne!(DeviceId::from_name("pixel-7"), DeviceId::from_name("pixel-8"));
    }
}
