//! Rebuilding one hierarchy level and reporting the result.

use crate::affected::{RefreshTarget, merge_variables, node_variables};
use crate::collaborators::{NodesProviderFactory, ProviderContext, UiStateProvider};
use crate::error::UpdateError;
use crate::records::{ExpandedNodeUpdate, HierarchyUpdateRecord};
use crate::registry::RegisteredCache;
use hiercache_kernel::{
    HashPath, HierarchyLevelId, HierarchyLevelIdentifier, NavNode, RulesetVariables,
};
use hiercache_store::{HierarchyLevelLocker, NodesCache, PagedNodes};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

type RulesetKey = (String, String);

/// Bookkeeping shared by every task of one update pass.
#[derive(Debug, Default)]
pub struct PassState {
    handled: BTreeSet<HierarchyLevelIdentifier>,
    handled_paths: BTreeMap<RulesetKey, Vec<HashPath>>,
    expanded: BTreeMap<RulesetKey, BTreeSet<HashPath>>,
    reported_full: BTreeSet<String>,
}

impl PassState {
    fn ancestor_handled(&self, key: &RulesetKey, path: &HashPath) -> bool {
        self.handled_paths
            .get(key)
            .is_some_and(|paths| paths.iter().any(|p| p.is_strict_prefix_of(path)))
    }

    fn expanded_nodes(
        &mut self,
        ui_state: &dyn UiStateProvider,
        key: &RulesetKey,
    ) -> &BTreeSet<HashPath> {
        self.expanded
            .entry(key.clone())
            .or_insert_with(|| ui_state.expanded_nodes(&key.0, &key.1))
    }

    /// True the first time a full report is requested for `ruleset_id`.
    pub(crate) fn claim_full_report(&mut self, ruleset_id: &str) -> bool {
        self.reported_full.insert(ruleset_id.to_string())
    }
}

#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub report: Option<HierarchyUpdateRecord>,
    /// The level holding the parent node, when the parent's children
    /// state flipped.
    pub grandparent: Option<RefreshTarget>,
}

enum Parent {
    Root,
    Node(Arc<NavNode>),
    Removed,
}

impl Parent {
    fn node(&self) -> Option<&Arc<NavNode>> {
        match self {
            Parent::Node(node) => Some(node),
            _ => None,
        }
    }
}

struct PreviousBuild {
    has_nodes: Option<bool>,
    variables: RulesetVariables,
}

/// Runs the refresh of single levels.
pub struct LevelRefresher<'a> {
    pub providers: &'a dyn NodesProviderFactory,
    pub ui_state: &'a dyn UiStateProvider,
}

impl LevelRefresher<'_> {
    pub fn refresh(
        &self,
        registered: &RegisteredCache,
        target: &RefreshTarget,
        locker: &mut HierarchyLevelLocker,
        pass: &mut PassState,
    ) -> Result<RefreshOutcome, UpdateError> {
        let cache = &registered.cache;
        let mut outcome = RefreshOutcome::default();
        if !pass.handled.insert(target.identifier.clone()) {
            return Ok(outcome);
        }
        let key: RulesetKey = (
            cache.connection_id().to_string(),
            target.identifier.ruleset_id.clone(),
        );

        let parent = locate_parent(cache, target)?;
        if matches!(parent, Parent::Removed) {
            tracing::debug!(ruleset = %key.1, "parent of refreshed level is gone");
            return Ok(outcome);
        }
        let identifier = target
            .identifier
            .with_parent(parent.node().and_then(|node| node.id));
        let parent_path = target.parent_path();
        let mut rebuilt_count = None;

        if pass.ancestor_handled(&key, &parent_path) {
            tracing::trace!(ruleset = %key.1, depth = parent_path.depth(), "ancestor already rebuilt");
        } else {
            pass.handled_paths
                .entry(key.clone())
                .or_default()
                .push(parent_path.clone());

            let previous = previous_build(cache, &identifier, &target.parent_variables)?;
            let rewritten = locker.rewrite_locked(|txn| {
                if let Some(removal_id) = txn.soft_delete_subtree(&identifier)? {
                    txn.hard_delete(removal_id)?;
                }
                Ok(())
            })?;
            if rewritten.is_none() {
                tracing::debug!(ruleset = %key.1, "lost the lock of the rebuilt level");
                return Ok(outcome);
            }

            let context = ProviderContext {
                cache,
                source: registered.source.as_ref(),
                level: &identifier,
                parent: parent.node().map(|node| node.with_children_unknown()),
                variables: previous.variables,
                locker: Some(&*locker),
            };
            let provider = self.providers.create(&context)?;
            let has_nodes = provider.has_nodes()?;
            let count = provider.nodes_count()?;
            rebuilt_count = Some(count);
            tracing::debug!(
                ruleset = %key.1,
                depth = parent_path.depth(),
                had_nodes = ?previous.has_nodes,
                has_nodes,
                count,
                "rebuilt hierarchy level"
            );

            if let (Some(had_nodes), Some(parent)) = (previous.has_nodes, parent.node())
                && had_nodes != has_nodes
            {
                outcome.grandparent = grandparent_target(cache, &identifier, parent)?;
            }
        }

        let parent = locate_parent(cache, target)?;
        if matches!(parent, Parent::Removed) {
            return Ok(outcome);
        }
        let expanded = pass.expanded_nodes(self.ui_state, &key);
        if let Some(node) = parent.node()
            && !expanded.contains(node.hash_path())
        {
            return Ok(outcome);
        }
        let wanted = immediate_children(expanded, &parent_path);

        let level = cache.find_hierarchy_level(
            &identifier.with_parent(parent.node().and_then(|node| node.id)),
        )?;
        let (stored_count, expanded_nodes) = match level {
            Some(level) => count_and_locate(cache, level.id, &wanted, rebuilt_count.is_none())?,
            None => (0, Vec::new()),
        };
        // A level rebuilt in this pass reports what its provider produced.
        let nodes_count = rebuilt_count.unwrap_or(stored_count);
        outcome.report = Some(HierarchyUpdateRecord {
            connection_id: key.0,
            ruleset_id: key.1,
            parent: parent.node().map(|node| NavNode::clone(node)),
            nodes_count,
            expanded_nodes,
        });
        Ok(outcome)
    }
}

fn locate_parent(cache: &NodesCache, target: &RefreshTarget) -> Result<Parent, UpdateError> {
    let Some(key) = &target.parent_key else {
        return Ok(Parent::Root);
    };
    Ok(
        match cache.locate_node_by_key(
            &target.identifier.ruleset_id,
            key,
            &target.parent_variables,
        )? {
            Some(node) => Parent::Node(node),
            None => Parent::Removed,
        },
    )
}

fn previous_build(
    cache: &Arc<NodesCache>,
    identifier: &HierarchyLevelIdentifier,
    fallback: &RulesetVariables,
) -> Result<PreviousBuild, UpdateError> {
    let unknown = || PreviousBuild {
        has_nodes: None,
        variables: fallback.clone(),
    };
    let Some(level) = cache.find_hierarchy_level(identifier)? else {
        return Ok(unknown());
    };
    let Some(variables) = level_variables(cache, level.id)? else {
        return Ok(unknown());
    };
    let total = PagedNodes::level(cache.clone(), level.id, variables.clone()).total_count()?;
    Ok(PreviousBuild {
        has_nodes: Some(total > 0),
        variables,
    })
}

/// Union of the level's data source variables, `None` while it has no
/// data sources.
fn level_variables(
    cache: &NodesCache,
    level_id: HierarchyLevelId,
) -> Result<Option<RulesetVariables>, UpdateError> {
    let sources = cache.read(|txn| txn.level_data_sources(level_id))?;
    if sources.is_empty() {
        return Ok(None);
    }
    Ok(Some(merge_variables(sources.into_iter().map(|ds| ds.variables))))
}

/// The physical level that shows `parent`.
fn grandparent_target(
    cache: &NodesCache,
    identifier: &HierarchyLevelIdentifier,
    parent: &NavNode,
) -> Result<Option<RefreshTarget>, UpdateError> {
    let Some(parent_id) = parent.id else {
        return Ok(None);
    };
    let root = HierarchyLevelIdentifier::live(
        identifier.connection_id.clone(),
        identifier.ruleset_id.clone(),
        None,
    );
    let Some(grandparent) = cache.get_physical_parent(parent_id)? else {
        return Ok(Some(RefreshTarget::root(root)));
    };
    let Some(grandparent_id) = grandparent.id else {
        return Ok(None);
    };
    let parent_variables = cache.read(|txn| node_variables(txn, grandparent_id))?;
    Ok(Some(RefreshTarget {
        identifier: root.with_parent(Some(grandparent_id)),
        parent_key: Some(grandparent.key.clone()),
        parent_variables,
    }))
}

/// Expanded paths below `parent` at the smallest extra depth.
fn immediate_children(expanded: &BTreeSet<HashPath>, parent: &HashPath) -> BTreeSet<HashPath> {
    let below: Vec<&HashPath> = expanded
        .iter()
        .filter(|path| parent.is_strict_prefix_of(path))
        .collect();
    let Some(depth) = below.iter().map(|path| path.depth()).min() else {
        return BTreeSet::new();
    };
    below
        .into_iter()
        .filter(|path| path.depth() == depth)
        .cloned()
        .collect()
}

fn count_and_locate(
    cache: &Arc<NodesCache>,
    level_id: HierarchyLevelId,
    wanted: &BTreeSet<HashPath>,
    count: bool,
) -> Result<(u64, Vec<ExpandedNodeUpdate>), UpdateError> {
    let variables = level_variables(cache, level_id)?.unwrap_or_default();
    let nodes = PagedNodes::level(cache.clone(), level_id, variables);
    let total = if count { nodes.total_count()? } else { 0 };
    let mut found = Vec::new();
    if wanted.is_empty() {
        return Ok((total, found));
    }
    for (position, node) in nodes.enumerate() {
        let node = node?;
        if wanted.contains(node.hash_path()) {
            found.push(ExpandedNodeUpdate {
                node: NavNode::clone(&node),
                position,
            });
            if found.len() == wanted.len() {
                break;
            }
        }
    }
    Ok((total, found))
}
