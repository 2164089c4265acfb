//! Seams to the host: node production, UI state and the content cache.

use crate::error::UpdateError;
use hiercache_kernel::{HashPath, HierarchyLevelIdentifier, NavNode, RulesetVariables};
use hiercache_store::{HierarchyLevelLocker, NodesCache, SourceConnection};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Which nodes a host currently shows expanded.
pub trait UiStateProvider: Send + Sync {
    /// Hash paths of expanded nodes for one connection and ruleset.
    fn expanded_nodes(&self, connection_id: &str, ruleset_id: &str) -> BTreeSet<HashPath>;
}

/// The host's cache of computed content.
pub trait ContentCache: Send + Sync {
    fn clear_ruleset(&self, ruleset_id: &str);
}

/// Everything a provider needs to (re)build one hierarchy level.
pub struct ProviderContext<'a> {
    pub cache: &'a Arc<NodesCache>,
    pub source: &'a dyn SourceConnection,
    pub level: &'a HierarchyLevelIdentifier,
    /// Parent node with its children state reset; `None` for the root.
    pub parent: Option<NavNode>,
    /// Variables the previous build of this level used.
    pub variables: RulesetVariables,
    /// The lock held on the level while it is rebuilt, if any.
    pub locker: Option<&'a HierarchyLevelLocker>,
}

impl ProviderContext<'_> {
    pub fn ruleset_id(&self) -> &str {
        &self.level.ruleset_id
    }
}

/// Builds node providers. Providers write what they produce through the
/// cache API (`reserve_data_source`, `cache_node`, `update_data_source`).
pub trait NodesProviderFactory: Send + Sync {
    fn create(&self, context: &ProviderContext<'_>) -> Result<Box<dyn NodesProvider>, UpdateError>;
}

pub trait NodesProvider {
    fn has_nodes(&self) -> Result<bool, UpdateError>;

    fn nodes_count(&self) -> Result<u64, UpdateError>;
}

/// A UI state provider that reports nothing expanded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NothingExpanded;

impl UiStateProvider for NothingExpanded {
    fn expanded_nodes(&self, _connection_id: &str, _ruleset_id: &str) -> BTreeSet<HashPath> {
        BTreeSet::new()
    }
}

/// A content cache for hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContentCache;

impl ContentCache for NoContentCache {
    fn clear_ruleset(&self, _ruleset_id: &str) {}
}
