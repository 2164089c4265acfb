//! # hiercache-kernel
//!
//! Value types shared by the hierarchy cache and its update engine.
//!
//! This crate provides:
//! - UUID-backed row ids and integer class/instance ids
//! - `NodeKey` / `NavNode` with root-to-node `HashPath` identity
//! - `NodeIndex`, the multi-component ordering index
//! - `RulesetVariables` and the variables matching rule
//! - hierarchy level and data source descriptors
//!
//! Nothing here touches storage. The SQLite engine lives in
//! `hiercache-store`; change propagation lives in `hiercache-update`.

pub mod error;
pub mod hash;
pub mod ids;
pub mod index;
pub mod level;
pub mod node;
pub mod variables;

pub use error::KernelError;
pub use hash::{ContentHash, ContentHashBuilder, HashPath};
pub use ids::{
    ClassId, DataSourceId, HierarchyLevelId, InstanceId, InstanceKey, NodeId, RemovalId,
    RulesetId, VariablesId,
};
pub use index::{NodeIndex, concat_stored_indexes};
pub use level::{
    DataSourceFilter, DataSourceIdentifier, DataSourceInfo, DataSourceParts,
    HierarchyLevelIdentifier, HierarchyLevelInfo, NewDataSource, RelatedInstanceInfo,
    RelationDirection,
};
pub use node::{
    GroupedInstances, NavNode, NodeKey, NodeKeyKind, NodeVisibility, TYPE_CLASS_GROUPING,
    TYPE_INSTANCES, TYPE_LABEL_GROUPING, TYPE_PROPERTY_GROUPING,
};
pub use variables::{RulesetVariables, variables_match};
