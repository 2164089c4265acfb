#![allow(dead_code)]

use hiercache_kernel::{
    ClassId, DataSourceFilter, DataSourceId, HashPath, HierarchyLevelId, InstanceKey, NavNode,
    NewDataSource, NodeId, NodeIndex, NodeKey, NodeVisibility,
};
use hiercache_store::{CacheConfig, CacheError, NodesCache, SourceConnection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CONNECTION: &str = "conn";

pub struct TestSource {
    pub id: String,
    pub path: Option<PathBuf>,
    pub marker: Option<String>,
    /// Base and derived classes per class.
    pub hierarchy: BTreeMap<ClassId, Vec<ClassId>>,
    pub filter_matches: bool,
}

impl TestSource {
    pub fn memory() -> Self {
        Self {
            id: CONNECTION.to_string(),
            path: None,
            marker: None,
            hierarchy: BTreeMap::new(),
            filter_matches: true,
        }
    }

    pub fn file(dir: &Path) -> Self {
        Self {
            path: Some(dir.join("model.db")),
            marker: Some("1".to_string()),
            ..Self::memory()
        }
    }
}

impl SourceConnection for TestSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn related_classes(&self, class_id: ClassId) -> Vec<ClassId> {
        let mut classes = vec![class_id];
        if let Some(related) = self.hierarchy.get(&class_id) {
            classes.extend(related.iter().copied());
        }
        classes
    }

    fn any_key_matches_filter(
        &self,
        _filter: &DataSourceFilter,
        _keys: &[InstanceKey],
    ) -> Result<bool, CacheError> {
        Ok(self.filter_matches)
    }

    fn last_modified_marker(&self) -> Option<String> {
        self.marker.clone()
    }
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time after epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "hiercache-{prefix}-{}-{unique}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn memory_cache() -> Arc<NodesCache> {
    Arc::new(NodesCache::open(&TestSource::memory(), CacheConfig::memory()).expect("open cache"))
}

/// Reserve a data source at `index` built from `classes` (class id,
/// polymorphic).
pub fn data_source(
    cache: &NodesCache,
    level_id: HierarchyLevelId,
    index: u64,
    classes: &[(u64, bool)],
) -> DataSourceId {
    let mut new = NewDataSource::new(level_id, NodeIndex::new(vec![index]));
    for (class_id, polymorphic) in classes {
        new.related_classes.insert(ClassId(*class_id), *polymorphic);
    }
    cache.reserve_data_source(&new).expect("reserve data source")
}

pub fn instance_node(parent: Option<&HashPath>, class_id: u64, instance_id: u64) -> NavNode {
    NavNode::new(
        NodeKey::instances(parent, "spec", vec![InstanceKey::new(class_id, instance_id)]),
        format!("{class_id}:{instance_id}"),
    )
}

/// Cache a visible instance node at local `index` and return its id.
pub fn cache_instance(
    cache: &NodesCache,
    data_source_id: DataSourceId,
    parent: Option<&HashPath>,
    class_id: u64,
    instance_id: u64,
    index: u64,
) -> NodeId {
    let mut node = instance_node(parent, class_id, instance_id);
    cache
        .cache_node(
            &mut node,
            data_source_id,
            &NodeIndex::new(vec![index]),
            NodeVisibility::Visible,
        )
        .expect("cache node")
}

pub fn rows(cache: &NodesCache, table: &str) -> u64 {
    cache
        .read(|txn| txn.count_rows(table))
        .expect("count rows")
}
