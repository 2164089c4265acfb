#![allow(dead_code)]

use hiercache_kernel::{
    ClassId, DataSourceFilter, HashPath, HierarchyLevelIdentifier, InstanceKey, NavNode,
    NewDataSource, NodeIndex, NodeKey, NodeVisibility, RulesetVariables,
};
use hiercache_store::{
    CacheConfig, CacheError, HierarchyLevelLocker, NodesCache, PagedNodes, SourceConnection,
};
use hiercache_update::{
    CacheRegistry, CollectingSink, ContentCache, NodesProvider, NodesProviderFactory,
    ProviderContext, UiStateProvider, UpdateError, UpdateHandler, UpdateRecord,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub const CONNECTION: &str = "conn";
pub const RULESET: &str = "R1";

pub struct TestSource {
    pub id: String,
}

impl TestSource {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl SourceConnection for TestSource {
    fn id(&self) -> &str {
        &self.id
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

    fn last_modified_marker(&self) -> Option<String> {
        None
    }
}

/// Children per parent label (`None` for the root), as `(class, instance)`.
#[derive(Clone, Default)]
pub struct Model {
    children: Arc<Mutex<BTreeMap<Option<String>, Vec<(u64, u64)>>>>,
    builds: Arc<Mutex<Vec<String>>>,
    /// Whether the level was locked while each build ran.
    locked: Arc<Mutex<Vec<bool>>>,
    failing: Arc<AtomicBool>,
    /// Count providers report instead of what they stored, when non-zero.
    reported_count: Arc<AtomicU64>,
}

impl Model {
    /// Make every following build fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Make providers report `count` nodes whatever they store.
    pub fn report_count(&self, count: u64) {
        self.reported_count.store(count, Ordering::SeqCst);
    }

    pub fn set(&self, parent: Option<&str>, children: &[(u64, u64)]) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(parent.map(str::to_string), children.to_vec());
    }

    fn children(&self, parent: Option<&str>) -> Vec<(u64, u64)> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&parent.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// Parent labels of every level built so far, `root` for root levels.
    pub fn builds(&self) -> Vec<String> {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn locked_during_builds(&self) -> Vec<bool> {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct BuiltLevel {
    count: u64,
}

impl NodesProvider for BuiltLevel {
    fn has_nodes(&self) -> Result<bool, UpdateError> {
        Ok(self.count > 0)
    }

    fn nodes_count(&self) -> Result<u64, UpdateError> {
        Ok(self.count)
    }
}

impl NodesProviderFactory for Model {
    fn create(&self, context: &ProviderContext<'_>) -> Result<Box<dyn NodesProvider>, UpdateError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpdateError::Provider("model unavailable".into()));
        }
        let parent_label = context.parent.as_ref().map(|p| p.label.clone());
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(parent_label.clone().unwrap_or_else(|| "root".into()));
        let observer = HierarchyLevelLocker::new(context.cache.clone(), context.level.clone());
        let locked = observer.is_locked()?;
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(locked);

        let children = self.children(parent_label.as_deref());
        let parent_path = context.parent.as_ref().map(|p| p.hash_path().clone());
        let level_id = context.cache.create_or_get_hierarchy_level(
            context.level.parent_node_id,
            context.ruleset_id(),
            None,
        )?;
        let mut new = NewDataSource::new(level_id, NodeIndex::new(vec![0]));
        new.variables = context.variables.clone();
        for (class_id, _) in &children {
            new.related_classes.insert(ClassId(*class_id), false);
        }
        let data_source_id = context.cache.reserve_data_source(&new)?;
        for (index, (class_id, instance_id)) in children.iter().enumerate() {
            let mut node = instance_node(parent_path.as_ref(), *class_id, *instance_id);
            context.cache.cache_node(
                &mut node,
                data_source_id,
                &NodeIndex::new(vec![index as u64]),
                NodeVisibility::Visible,
            )?;
        }
        let count = match self.reported_count.load(Ordering::SeqCst) {
            0 => children.len() as u64,
            count => count,
        };
        Ok(Box::new(BuiltLevel { count }))
    }
}

pub fn instance_node(parent: Option<&HashPath>, class_id: u64, instance_id: u64) -> NavNode {
    NavNode::new(
        NodeKey::instances(parent, "spec", vec![InstanceKey::new(class_id, instance_id)]),
        format!("{class_id}:{instance_id}"),
    )
}

/// Expanded hash paths, shared with the test.
#[derive(Clone, Default)]
pub struct Expanded(Arc<Mutex<BTreeSet<HashPath>>>);

impl Expanded {
    pub fn expand(&self, node: &NavNode) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.hash_path().clone());
    }
}

impl UiStateProvider for Expanded {
    fn expanded_nodes(&self, _connection_id: &str, _ruleset_id: &str) -> BTreeSet<HashPath> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Rulesets whose content was cleared, in order.
#[derive(Clone, Default)]
pub struct ClearedContent(Arc<Mutex<Vec<String>>>);

impl ClearedContent {
    pub fn rulesets(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ContentCache for ClearedContent {
    fn clear_ruleset(&self, ruleset_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ruleset_id.to_string());
    }
}

pub struct Harness {
    pub registry: Arc<CacheRegistry>,
    pub cache: Arc<NodesCache>,
    pub source: Arc<TestSource>,
    pub model: Model,
    pub expanded: Expanded,
    pub content: ClearedContent,
    pub sink: CollectingSink,
    pub handler: UpdateHandler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_model(Model::default())
    }

    pub fn with_model(model: Model) -> Self {
        let registry = Arc::new(CacheRegistry::new());
        let source = Arc::new(TestSource::new(CONNECTION));
        let cache = registry
            .register(source.clone(), CacheConfig::memory())
            .expect("register cache");
        let expanded = Expanded::default();
        let content = ClearedContent::default();
        let sink = CollectingSink::new();
        let handler = UpdateHandler::new(
            registry.clone(),
            Arc::new(model.clone()),
            Box::new(sink.clone()),
        )
        .with_ui_state(Arc::new(expanded.clone()))
        .with_content_cache(Arc::new(content.clone()));
        Self {
            registry,
            cache,
            source,
            model,
            expanded,
            content,
            sink,
            handler,
        }
    }

    /// Build the level below `parent` the way a host would on first
    /// expansion, returning its nodes.
    pub fn build(&self, parent: Option<&NavNode>, variables: RulesetVariables) -> Vec<Arc<NavNode>> {
        let level = HierarchyLevelIdentifier::live(CONNECTION, RULESET, parent.and_then(|p| p.id));
        let context = ProviderContext {
            cache: &self.cache,
            source: self.source.as_ref(),
            level: &level,
            parent: parent.map(NavNode::with_children_unknown),
            variables: variables.clone(),
            locker: None,
        };
        self.model.create(&context).expect("build level");
        self.level_nodes(parent, variables)
    }

    pub fn level_nodes(
        &self,
        parent: Option<&NavNode>,
        variables: RulesetVariables,
    ) -> Vec<Arc<NavNode>> {
        let level = HierarchyLevelIdentifier::live(CONNECTION, RULESET, parent.and_then(|p| p.id));
        let Some(info) = self.cache.find_hierarchy_level(&level).expect("find level") else {
            return Vec::new();
        };
        PagedNodes::level(self.cache.clone(), info.id, variables)
            .collect::<Result<Vec<_>, _>>()
            .expect("read level")
    }

    /// Records projected to labels and counts.
    pub fn drain_records(&self) -> Value {
        Value::Array(self.sink.drain().iter().map(project).collect())
    }
}

pub fn project(record: &UpdateRecord) -> Value {
    match record {
        UpdateRecord::Hierarchy(record) => json!({
            "count": record.nodes_count,
            "expanded": record
                .expanded_nodes
                .iter()
                .map(|e| json!({ "label": e.node.label, "position": e.position }))
                .collect::<Vec<_>>(),
            "parent": record.parent.as_ref().map(|p| p.label.clone()),
            "record": "hierarchy",
            "ruleset": record.ruleset_id,
        }),
        UpdateRecord::Full(record) => json!({
            "kind": record.kind,
            "record": "full",
            "ruleset": record.ruleset_id,
        }),
    }
}
