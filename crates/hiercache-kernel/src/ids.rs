//! Identifier newtypes.
//!
//! Cache rows are keyed by random UUIDs stored as hyphenated text.
//! Source classes and instances are keyed by the integer ids the data
//! source hands out.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|source| KernelError::InvalidId {
                        kind: $kind,
                        value: s.to_string(),
                        source,
                    })
            }
        }
    };
}

uuid_id!(
    /// A cached navigation node.
    NodeId,
    "node"
);
uuid_id!(
    /// One physical hierarchy level row (live or tombstoned).
    HierarchyLevelId,
    "hierarchy level"
);
uuid_id!(
    /// A provider's slice of a hierarchy level.
    DataSourceId,
    "data source"
);
uuid_id!(
    /// A cached ruleset row.
    RulesetId,
    "ruleset"
);
uuid_id!(
    /// A distinct set of ruleset variable values.
    VariablesId,
    "variables"
);
uuid_id!(
    /// Tombstone marker shared by every level of a soft-deleted subtree.
    RemovalId,
    "removal"
);

/// A class in the data source's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u64);

/// An instance of some class in the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A data instance reference: which class and which row of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub class_id: ClassId,
    pub instance_id: InstanceId,
}

impl InstanceKey {
    pub fn new(class_id: u64, instance_id: u64) -> Self {
        Self {
            class_id: ClassId(class_id),
            instance_id: InstanceId(instance_id),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_id, self.instance_id)
    }
}
