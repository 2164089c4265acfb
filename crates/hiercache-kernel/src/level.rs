//! Hierarchy level and data source descriptors.

use crate::ids::{ClassId, DataSourceId, HierarchyLevelId, InstanceKey, NodeId, RemovalId};
use crate::index::NodeIndex;
use crate::variables::RulesetVariables;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::BitOr;

/// Logical identity of a hierarchy level.
///
/// At most one live level (no removal id) exists per
/// `(parent_node_id, ruleset_id)`. Tombstoned copies carry the removal id
/// of the soft delete that retired them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HierarchyLevelIdentifier {
    pub connection_id: String,
    pub ruleset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removal_id: Option<RemovalId>,
}

impl HierarchyLevelIdentifier {
    /// The live level of `ruleset_id` under `parent_node_id`.
    pub fn live(
        connection_id: impl Into<String>,
        ruleset_id: impl Into<String>,
        parent_node_id: Option<NodeId>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            ruleset_id: ruleset_id.into(),
            parent_node_id,
            removal_id: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_node_id.is_none()
    }

    pub fn with_parent(&self, parent_node_id: Option<NodeId>) -> Self {
        Self {
            parent_node_id,
            ..self.clone()
        }
    }
}

/// A stored hierarchy level row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyLevelInfo {
    pub id: HierarchyLevelId,
    pub identifier: HierarchyLevelIdentifier,
    /// Epoch milliseconds of the last lock stamp, if any.
    pub lock_timestamp: Option<i64>,
}

/// Where a data source sits: its level, its position in that level and
/// the data source it is nested under, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceIdentifier {
    pub hierarchy_level_id: HierarchyLevelId,
    pub ordering_index: NodeIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DataSourceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationDirection {
    Forward,
    Backward,
}

/// The producing rule restricts results to instances related to these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedInstanceInfo {
    pub relationship_class_ids: Vec<ClassId>,
    pub direction: RelationDirection,
    pub instance_keys: Vec<InstanceKey>,
}

/// Instance filter a data source was produced with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_instance: Option<RelatedInstanceInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_filter: String,
}

impl DataSourceFilter {
    /// True when a class match alone cannot prove the data source is affected.
    pub fn is_restrictive(&self) -> bool {
        self.related_instance.is_some() || !self.instance_filter.is_empty()
    }
}

/// Input for reserving a data source slot.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDataSource {
    pub identifier: DataSourceIdentifier,
    pub filter: DataSourceFilter,
    /// Only the variables the producing rule actually reads.
    pub variables: RulesetVariables,
    pub specification_hash: String,
    pub node_types: String,
    /// Class id to polymorphic flag.
    pub related_classes: BTreeMap<ClassId, bool>,
    pub custom_json: String,
}

impl NewDataSource {
    pub fn new(hierarchy_level_id: HierarchyLevelId, ordering_index: NodeIndex) -> Self {
        Self {
            identifier: DataSourceIdentifier {
                hierarchy_level_id,
                ordering_index,
                parent_id: None,
            },
            filter: DataSourceFilter::default(),
            variables: RulesetVariables::new(),
            specification_hash: String::new(),
            node_types: String::new(),
            related_classes: BTreeMap::new(),
            custom_json: String::new(),
        }
    }
}

/// A stored data source row with its related classes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceInfo {
    pub id: DataSourceId,
    pub identifier: DataSourceIdentifier,
    pub filter: DataSourceFilter,
    pub variables: RulesetVariables,
    pub specification_hash: String,
    pub node_types: String,
    pub has_nodes: Option<bool>,
    pub direct_nodes_count: Option<u64>,
    pub total_nodes_count: Option<u64>,
    pub is_initialized: bool,
    pub custom_json: String,
    pub related_classes: BTreeMap<ClassId, bool>,
}

/// Which columns of a data source an update writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataSourceParts(u32);

impl DataSourceParts {
    pub const NONE: Self = Self(0);
    pub const FILTER: Self = Self(1);
    pub const VARIABLES: Self = Self(1 << 1);
    pub const HAS_NODES: Self = Self(1 << 2);
    pub const DIRECT_NODES_COUNT: Self = Self(1 << 3);
    pub const TOTAL_NODES_COUNT: Self = Self(1 << 4);
    pub const IS_INITIALIZED: Self = Self(1 << 5);
    pub const SPECIFICATION_HASH: Self = Self(1 << 6);
    pub const NODE_TYPES: Self = Self(1 << 7);
    pub const CUSTOM_JSON: Self = Self(1 << 8);
    pub const RELATED_CLASSES: Self = Self(1 << 9);
    pub const ALL: Self = Self((1 << 10) - 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DataSourceParts {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_combine_and_test() {
        let parts = DataSourceParts::HAS_NODES | DataSourceParts::IS_INITIALIZED;
        assert!(parts.contains(DataSourceParts::HAS_NODES));
        assert!(parts.contains(DataSourceParts::IS_INITIALIZED));
        assert!(!parts.contains(DataSourceParts::FILTER));
        assert!(!parts.contains(DataSourceParts::NONE));
        assert!(DataSourceParts::ALL.contains(DataSourceParts::RELATED_CLASSES));
        assert!(DataSourceParts::NONE.is_empty());
    }

    #[test]
    fn only_related_or_textual_filters_are_restrictive() {
        assert!(!DataSourceFilter::default().is_restrictive());
        let textual = DataSourceFilter {
            instance_filter: "this.Name = 'x'".to_string(),
            ..DataSourceFilter::default()
        };
        assert!(textual.is_restrictive());
    }

    #[test]
    fn identifiers_order_root_first() {
        let root = HierarchyLevelIdentifier::live("c", "r", None);
        let child = HierarchyLevelIdentifier::live("c", "r", Some(NodeId::generate()));
        assert!(root.is_root());
        assert!(root < child);
        assert_eq!(child.with_parent(None), root);
    }
}
