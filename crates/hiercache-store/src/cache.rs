//! The nodes cache: one SQLite connection per source connection, a hot
//! node cache in front of it, and scoped transactions around both.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::factory::{StoreFactory, StoreLocation};
use crate::hot::HotNodeCache;
use crate::maintenance;
use crate::source::SourceConnection;
use crate::txn::{CacheTxn, RulesetUse};
use hiercache_kernel::{
    DataSourceId, DataSourceInfo, DataSourceParts, HierarchyLevelId, HierarchyLevelIdentifier,
    HierarchyLevelInfo, InstanceKey, NavNode, NewDataSource, NodeId, NodeIndex, NodeKey,
    NodeVisibility, RemovalId, RulesetVariables,
};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Persistent cache of hierarchy levels for one source connection.
///
/// All access goes through [`NodesCache::read`] or
/// [`NodesCache::savepoint`], which hold the connection mutex for the
/// duration of the closure. Do not call back into the same cache from
/// inside such a closure; use the [`CacheTxn`] it receives instead.
pub struct NodesCache {
    // Declared before `factory` so the connection closes before teardown.
    db: Mutex<Connection>,
    hot: HotNodeCache,
    connection_id: String,
    config: CacheConfig,
    factory: Mutex<StoreFactory>,
}

impl std::fmt::Debug for NodesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodesCache")
            .field("connection_id", &self.connection_id)
            .field("hot_entries", &self.hot.len())
            .finish_non_exhaustive()
    }
}

impl NodesCache {
    /// Open or create the cache for `source`.
    pub fn open(source: &dyn SourceConnection, config: CacheConfig) -> Result<Self, CacheError> {
        let (factory, conn) = StoreFactory::open(source, &config)?;
        Ok(Self {
            db: Mutex::new(conn),
            hot: HotNodeCache::new(config.hot_cache_capacity),
            connection_id: source.id().to_string(),
            config,
            factory: Mutex::new(factory),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn hot_cache(&self) -> &HotNodeCache {
        &self.hot
    }

    pub fn location(&self) -> Result<StoreLocation, CacheError> {
        Ok(self
            .factory
            .lock()
            .map_err(|_| CacheError::Poisoned("store factory"))?
            .location()
            .clone())
    }

    /// Record that this process modified the source, so the store is not
    /// discarded as stale on the next open.
    pub fn note_source_modified(&self, source: &dyn SourceConnection) -> Result<(), CacheError> {
        self.factory
            .lock()
            .map_err(|_| CacheError::Poisoned("store factory"))?
            .set_source_marker(source.last_modified_marker());
        Ok(())
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.db
            .lock()
            .map_err(|_| CacheError::Poisoned("store connection"))
    }

    /// Run `f` inside a read transaction.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&CacheTxn<'_>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut conn = self.lock_db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = CacheTxn::new(&tx, &self.hot, &self.connection_id, &self.config);
        let value = f(&txn)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a write transaction. On error everything `f` wrote
    /// is rolled back and the hot cache is dropped.
    pub fn savepoint<T>(
        &self,
        f: impl FnOnce(&CacheTxn<'_>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut conn = self.lock_db()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = CacheTxn::new(&tx, &self.hot, &self.connection_id, &self.config);
        match f(&txn) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                drop(tx);
                self.hot.clear();
                tracing::debug!(error = %err, "rolled back cache savepoint");
                Err(err)
            }
        }
    }

    /// [`NodesCache::savepoint`] for large writes: once committed, planner
    /// statistics are refreshed if the store has grown past the configured
    /// node count.
    pub fn bulk_savepoint<T>(
        &self,
        f: impl FnOnce(&CacheTxn<'_>) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let value = self.savepoint(f)?;
        let nodes = self.read(|txn| txn.count_rows("nodes"))?;
        if nodes > self.config.optimize_threshold {
            self.optimize()?;
        }
        Ok(value)
    }

    pub fn optimize(&self) -> Result<(), CacheError> {
        let conn = self.lock_db()?;
        maintenance::optimize(&conn)?;
        tracing::debug!(connection = %self.connection_id, "optimized hierarchy cache");
        Ok(())
    }

    // Single-operation conveniences.

    pub fn on_ruleset_used(&self, identifier: &str, hash: &str) -> Result<RulesetUse, CacheError> {
        self.savepoint(|txn| txn.on_ruleset_used(identifier, hash))
    }

    pub fn on_variables_used(
        &self,
        ruleset_id: &str,
        variables: &RulesetVariables,
    ) -> Result<usize, CacheError> {
        self.savepoint(|txn| txn.on_variables_used(ruleset_id, variables))
    }

    pub fn create_or_get_hierarchy_level(
        &self,
        parent_node_id: Option<NodeId>,
        ruleset_id: &str,
        removal_id: Option<RemovalId>,
    ) -> Result<HierarchyLevelId, CacheError> {
        self.savepoint(|txn| txn.create_or_get_hierarchy_level(parent_node_id, ruleset_id, removal_id))
    }

    pub fn find_hierarchy_level(
        &self,
        identifier: &HierarchyLevelIdentifier,
    ) -> Result<Option<HierarchyLevelInfo>, CacheError> {
        self.read(|txn| txn.find_hierarchy_level(identifier))
    }

    pub fn get_parent_hierarchy_level(
        &self,
        node_id: NodeId,
    ) -> Result<Option<HierarchyLevelInfo>, CacheError> {
        self.read(|txn| txn.get_parent_hierarchy_level(node_id))
    }

    pub fn is_hierarchy_level_initialized(
        &self,
        level_id: HierarchyLevelId,
        variables: &RulesetVariables,
    ) -> Result<bool, CacheError> {
        self.read(|txn| txn.is_hierarchy_level_initialized(level_id, variables))
    }

    pub fn reserve_data_source(&self, new: &NewDataSource) -> Result<DataSourceId, CacheError> {
        self.savepoint(|txn| txn.reserve_data_source(new))
    }

    pub fn find_data_source(
        &self,
        level_id: HierarchyLevelId,
        ordering_index: &NodeIndex,
        variables: &RulesetVariables,
    ) -> Result<Option<DataSourceInfo>, CacheError> {
        self.read(|txn| txn.find_data_source(level_id, ordering_index, variables))
    }

    pub fn update_data_source(
        &self,
        info: &DataSourceInfo,
        parts: DataSourceParts,
    ) -> Result<(), CacheError> {
        self.savepoint(|txn| txn.update_data_source(info, parts))
    }

    pub fn cache_node(
        &self,
        node: &mut NavNode,
        data_source_id: DataSourceId,
        index: &NodeIndex,
        visibility: NodeVisibility,
    ) -> Result<NodeId, CacheError> {
        self.savepoint(|txn| txn.cache_node(node, data_source_id, index, visibility))
    }

    pub fn get_node(&self, id: NodeId) -> Result<Option<Arc<NavNode>>, CacheError> {
        if let Some(node) = self.hot.get(&id) {
            return Ok(Some(node));
        }
        self.read(|txn| txn.get_node(id))
    }

    pub fn locate_node_by_key(
        &self,
        ruleset_id: &str,
        key: &NodeKey,
        variables: &RulesetVariables,
    ) -> Result<Option<Arc<NavNode>>, CacheError> {
        self.read(|txn| txn.locate_node_by_key(ruleset_id, key, variables))
    }

    pub fn get_physical_parent(&self, node_id: NodeId) -> Result<Option<Arc<NavNode>>, CacheError> {
        self.read(|txn| txn.get_physical_parent(node_id))
    }

    pub fn get_related_hierarchy_levels(
        &self,
        source: &dyn SourceConnection,
        keys: &[InstanceKey],
    ) -> Result<BTreeSet<HierarchyLevelIdentifier>, CacheError> {
        self.read(|txn| txn.get_related_hierarchy_levels(source, keys))
    }

    pub fn clear(&self, ruleset_id: Option<&str>) -> Result<(), CacheError> {
        self.savepoint(|txn| txn.clear(ruleset_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiercache_kernel::{ClassId, DataSourceFilter};
    use std::path::Path;

    struct MemorySource;

    impl SourceConnection for MemorySource {
        fn id(&self) -> &str {
            "memory"
        }

        fn file_path(&self) -> Option<&Path> {
            None
        }

        fn related_classes(&self, class_id: ClassId) -> Vec<ClassId> {
            vec![class_id]
        }

        fn any_key_matches_filter(
            &self,
            _filter: &DataSourceFilter,
            _keys: &[InstanceKey],
        ) -> Result<bool, CacheError> {
            Ok(true)
        }
    }

    fn cache() -> NodesCache {
        NodesCache::open(&MemorySource, CacheConfig::memory()).expect("open memory cache")
    }

    #[test]
    fn failed_savepoint_rolls_back_writes() {
        let cache = cache();
        let err = cache
            .savepoint(|txn| {
                txn.create_or_get_hierarchy_level(None, "R1", None)?;
                Err::<(), _>(CacheError::Inconsistent("abort".into()))
            })
            .expect_err("closure error propagates");
        assert!(matches!(err, CacheError::Inconsistent(_)));
        assert_eq!(
            cache
                .read(|txn| txn.count_rows("hierarchy_levels"))
                .expect("count"),
            0
        );
    }

    #[test]
    fn ruleset_hash_change_drops_cached_levels() {
        let cache = cache();
        assert!(matches!(
            cache.on_ruleset_used("R1", "h1").expect("first use"),
            RulesetUse::Created(_)
        ));
        cache
            .create_or_get_hierarchy_level(None, "R1", None)
            .expect("level");
        assert!(matches!(
            cache.on_ruleset_used("R1", "h1").expect("same hash"),
            RulesetUse::Reused(_)
        ));
        assert_eq!(
            cache.read(|txn| txn.count_rows("hierarchy_levels")).expect("count"),
            1
        );
        assert!(matches!(
            cache.on_ruleset_used("R1", "h2").expect("new hash"),
            RulesetUse::Replaced(_)
        ));
        assert_eq!(
            cache.read(|txn| txn.count_rows("hierarchy_levels")).expect("count"),
            0
        );
    }

    #[test]
    fn hashless_ruleset_adopts_first_hash() {
        let cache = cache();
        cache
            .create_or_get_hierarchy_level(None, "R1", None)
            .expect("level creates a hash-less ruleset");
        assert!(matches!(
            cache.on_ruleset_used("R1", "h1").expect("use"),
            RulesetUse::Reused(_)
        ));
        assert_eq!(
            cache.read(|txn| txn.count_rows("hierarchy_levels")).expect("count"),
            1
        );
    }

    #[test]
    fn clear_by_ruleset_keeps_other_rulesets() {
        let cache = cache();
        cache.create_or_get_hierarchy_level(None, "R1", None).expect("R1");
        cache.create_or_get_hierarchy_level(None, "R2", None).expect("R2");
        cache.clear(Some("R1")).expect("clear R1");
        assert!(
            cache
                .find_hierarchy_level(&HierarchyLevelIdentifier::live("memory", "R1", None))
                .expect("find")
                .is_none()
        );
        assert!(
            cache
                .find_hierarchy_level(&HierarchyLevelIdentifier::live("memory", "R2", None))
                .expect("find")
                .is_some()
        );
        cache.clear(None).expect("clear all");
        assert_eq!(cache.read(|txn| txn.count_rows("rulesets")).expect("count"), 0);
    }
}
