//! Navigation nodes and their keys.

use crate::hash::{ContentHash, HashPath};
use crate::ids::{ClassId, InstanceKey, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_INSTANCES: &str = "instances";
pub const TYPE_CLASS_GROUPING: &str = "class_grouping";
pub const TYPE_PROPERTY_GROUPING: &str = "property_grouping";
pub const TYPE_LABEL_GROUPING: &str = "label_grouping";

/// How a node participates in the level it was produced for.
///
/// Virtual nodes are never returned themselves; their children are
/// spliced into the parent level in their place. Hidden nodes are kept
/// for bookkeeping but never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeVisibility {
    Visible,
    Virtual,
    Hidden,
}

impl NodeVisibility {
    pub fn as_i64(self) -> i64 {
        match self {
            NodeVisibility::Visible => 0,
            NodeVisibility::Virtual => 1,
            NodeVisibility::Hidden => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(NodeVisibility::Visible),
            1 => Some(NodeVisibility::Virtual),
            2 => Some(NodeVisibility::Hidden),
            _ => None,
        }
    }
}

/// Instances gathered under a grouping node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedInstances {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<InstanceKey>>,
}

impl GroupedInstances {
    pub fn of(keys: Vec<InstanceKey>) -> Self {
        Self {
            count: keys.len() as u64,
            keys: Some(keys),
        }
    }
}

/// Type-specific part of a node key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKeyKind {
    Instances {
        instance_keys: Vec<InstanceKey>,
    },
    ClassGrouping {
        class_id: ClassId,
        is_polymorphic: bool,
        grouped: GroupedInstances,
    },
    PropertyGrouping {
        class_id: ClassId,
        property_name: String,
        grouping_values: Vec<Value>,
        grouped: GroupedInstances,
    },
    LabelGrouping {
        label: String,
        grouped: GroupedInstances,
    },
    /// Any node type the storage layer has no dedicated columns for.
    Other {
        node_type: String,
    },
}

impl NodeKeyKind {
    pub fn node_type(&self) -> &str {
        match self {
            NodeKeyKind::Instances { .. } => TYPE_INSTANCES,
            NodeKeyKind::ClassGrouping { .. } => TYPE_CLASS_GROUPING,
            NodeKeyKind::PropertyGrouping { .. } => TYPE_PROPERTY_GROUPING,
            NodeKeyKind::LabelGrouping { .. } => TYPE_LABEL_GROUPING,
            NodeKeyKind::Other { node_type } => node_type.as_str(),
        }
    }

    fn content_hash(&self, specification_id: &str) -> ContentHash {
        let builder = ContentHash::builder()
            .field("type", self.node_type())
            .field("specification", specification_id);
        match self {
            NodeKeyKind::Instances { instance_keys } => {
                let mut keys = instance_keys.clone();
                keys.sort();
                keys.iter()
                    .fold(builder, |b, key| b.field("instance", &key.to_string()))
                    .finish()
            }
            NodeKeyKind::ClassGrouping {
                class_id,
                is_polymorphic,
                ..
            } => builder
                .field_u64("class", class_id.0)
                .field_bool("polymorphic", *is_polymorphic)
                .finish(),
            NodeKeyKind::PropertyGrouping {
                class_id,
                property_name,
                grouping_values,
                ..
            } => builder
                .field_u64("class", class_id.0)
                .field("property", property_name)
                .field(
                    "values",
                    &Value::Array(grouping_values.clone()).to_string(),
                )
                .finish(),
            NodeKeyKind::LabelGrouping { label, .. } => builder.field("label", label).finish(),
            NodeKeyKind::Other { .. } => builder.finish(),
        }
    }
}

/// Identity of a node: its type, the rule that produced it, and its hash
/// path from the hierarchy root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKey {
    pub specification_id: String,
    #[serde(flatten)]
    pub kind: NodeKeyKind,
    pub hash_path: HashPath,
}

impl NodeKey {
    /// Build a key under `parent` (the parent node's hash path, `None` at
    /// the root), deriving its own hash from the key content.
    pub fn new(
        parent: Option<&HashPath>,
        specification_id: impl Into<String>,
        kind: NodeKeyKind,
    ) -> Self {
        let specification_id = specification_id.into();
        let hash = kind.content_hash(&specification_id);
        let hash_path = parent.cloned().unwrap_or_default().child(hash);
        Self {
            specification_id,
            kind,
            hash_path,
        }
    }

    pub fn instances(
        parent: Option<&HashPath>,
        specification_id: impl Into<String>,
        instance_keys: Vec<InstanceKey>,
    ) -> Self {
        Self::new(
            parent,
            specification_id,
            NodeKeyKind::Instances { instance_keys },
        )
    }

    pub fn class_grouping(
        parent: Option<&HashPath>,
        specification_id: impl Into<String>,
        class_id: ClassId,
        is_polymorphic: bool,
        grouped: GroupedInstances,
    ) -> Self {
        Self::new(
            parent,
            specification_id,
            NodeKeyKind::ClassGrouping {
                class_id,
                is_polymorphic,
                grouped,
            },
        )
    }

    pub fn label_grouping(
        parent: Option<&HashPath>,
        specification_id: impl Into<String>,
        label: impl Into<String>,
        grouped: GroupedInstances,
    ) -> Self {
        Self::new(
            parent,
            specification_id,
            NodeKeyKind::LabelGrouping {
                label: label.into(),
                grouped,
            },
        )
    }

    /// Reassemble a key read back from storage.
    pub fn from_parts(
        specification_id: impl Into<String>,
        kind: NodeKeyKind,
        hash_path: HashPath,
    ) -> Self {
        Self {
            specification_id: specification_id.into(),
            kind,
            hash_path,
        }
    }

    pub fn node_type(&self) -> &str {
        self.kind.node_type()
    }

    /// Instances this key represents directly. Empty for grouping keys.
    pub fn instance_keys(&self) -> &[InstanceKey] {
        match &self.kind {
            NodeKeyKind::Instances { instance_keys } => instance_keys,
            _ => &[],
        }
    }
}

/// A cached navigation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavNode {
    /// Assigned when the node is first cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    /// The node whose level this node belongs to (virtual parents included).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub key: NodeKey,
    pub label: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extended_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_keys_query: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_node_ids: Vec<NodeId>,
    /// `None` while nobody has determined whether children exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_children: Option<bool>,
}

impl NavNode {
    pub fn new(key: NodeKey, label: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id: None,
            key,
            label: label.into(),
            extended_data: Value::Null,
            instance_keys_query: None,
            merged_node_ids: Vec::new(),
            has_children: None,
        }
    }

    pub fn hash_path(&self) -> &HashPath {
        &self.key.hash_path
    }

    /// A copy handed to node producers: same identity, children unknown.
    pub fn with_children_unknown(&self) -> Self {
        let mut node = self.clone();
        node.has_children = None;
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_ignores_label_and_grouped_counts() {
        let a = NodeKey::class_grouping(
            None,
            "spec",
            ClassId(7),
            false,
            GroupedInstances::of(vec![InstanceKey::new(7, 1)]),
        );
        let b = NodeKey::class_grouping(
            None,
            "spec",
            ClassId(7),
            false,
            GroupedInstances::of(vec![InstanceKey::new(7, 1), InstanceKey::new(7, 2)]),
        );
        assert_eq!(a.hash_path, b.hash_path);
    }

    #[test]
    fn instance_key_order_does_not_change_identity() {
        let a = NodeKey::instances(
            None,
            "spec",
            vec![InstanceKey::new(1, 1), InstanceKey::new(1, 2)],
        );
        let b = NodeKey::instances(
            None,
            "spec",
            vec![InstanceKey::new(1, 2), InstanceKey::new(1, 1)],
        );
        assert_eq!(a.hash_path, b.hash_path);
    }

    #[test]
    fn child_paths_extend_parent_paths() {
        let parent = NodeKey::instances(None, "root", vec![InstanceKey::new(1, 1)]);
        let child = NodeKey::label_grouping(
            Some(&parent.hash_path),
            "child",
            "Group",
            GroupedInstances::default(),
        );
        assert_eq!(child.hash_path.depth(), 2);
        assert!(parent.hash_path.is_strict_prefix_of(&child.hash_path));
        assert_eq!(child.node_type(), TYPE_LABEL_GROUPING);
        assert!(child.instance_keys().is_empty());
    }

    #[test]
    fn visibility_storage_codes_round_trip() {
        for visibility in [
            NodeVisibility::Visible,
            NodeVisibility::Virtual,
            NodeVisibility::Hidden,
        ] {
            assert_eq!(
                NodeVisibility::from_i64(visibility.as_i64()),
                Some(visibility)
            );
        }
        assert_eq!(NodeVisibility::from_i64(9), None);
    }

    #[test]
    fn provider_copy_forgets_children() {
        let mut node = NavNode::new(
            NodeKey::instances(None, "s", vec![InstanceKey::new(1, 1)]),
            "n",
        );
        node.has_children = Some(true);
        assert_eq!(node.with_children_unknown().has_children, None);
    }
}
