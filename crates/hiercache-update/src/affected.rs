//! Which cached levels a change touches.
//!
//! Candidate levels are mapped to the physical level that shows their
//! nodes, ordered root first, and pruned to the topmost level per
//! ruleset path: refreshing an ancestor rebuilds everything below it.
//! Survivors are locked before anything is rebuilt.

use crate::error::UpdateError;
use hiercache_kernel::{
    HashPath, HierarchyLevelIdentifier, InstanceKey, NodeId, NodeKey, RulesetVariables,
};
use hiercache_store::{
    CacheError, CacheTxn, HierarchyLevelLocker, LockOptions, LockOutcome, NodesCache,
    SourceConnection,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A level to rebuild, with enough of its parent to find it again.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTarget {
    pub identifier: HierarchyLevelIdentifier,
    /// `None` for root levels.
    pub parent_key: Option<NodeKey>,
    /// Variables under which the parent node was cached.
    pub parent_variables: RulesetVariables,
}

impl RefreshTarget {
    pub fn root(identifier: HierarchyLevelIdentifier) -> Self {
        Self {
            identifier,
            parent_key: None,
            parent_variables: RulesetVariables::new(),
        }
    }

    pub fn parent_path(&self) -> HashPath {
        self.parent_key
            .as_ref()
            .map(|key| key.hash_path.clone())
            .unwrap_or_default()
    }
}

/// A target and the lock taken on it.
#[derive(Debug)]
pub struct LockedTarget {
    pub target: RefreshTarget,
    pub locker: HierarchyLevelLocker,
}

/// Levels affected by changes to `keys`, locked.
pub fn discover_affected_levels(
    cache: &Arc<NodesCache>,
    source: &dyn SourceConnection,
    keys: &[InstanceKey],
) -> Result<Vec<LockedTarget>, UpdateError> {
    let related = cache.read(|txn| txn.get_related_hierarchy_levels(source, keys))?;
    tracing::debug!(keys = keys.len(), related = related.len(), "discovering affected levels");
    prune_and_lock(cache, related)
}

/// Levels of `ruleset_id` built with variables that mention `variable_id`,
/// locked.
pub fn discover_levels_using_variable(
    cache: &Arc<NodesCache>,
    ruleset_id: &str,
    variable_id: &str,
) -> Result<Vec<LockedTarget>, UpdateError> {
    let related = cache.read(|txn| txn.get_levels_using_variable(ruleset_id, variable_id))?;
    prune_and_lock(cache, related)
}

pub(crate) fn prune_and_lock(
    cache: &Arc<NodesCache>,
    identifiers: BTreeSet<HierarchyLevelIdentifier>,
) -> Result<Vec<LockedTarget>, UpdateError> {
    let targets = cache.read(|txn| {
        let mut physical = BTreeMap::new();
        for identifier in identifiers {
            if let Some(target) = physical_target(txn, identifier)? {
                physical.entry(target.identifier.clone()).or_insert(target);
            }
        }
        Ok(physical.into_values().collect::<Vec<_>>())
    })?;

    let mut locked = Vec::new();
    for target in prune_nested(targets) {
        let mut locker = HierarchyLevelLocker::new(cache.clone(), target.identifier.clone());
        match locker.lock(LockOptions::default().with_child_check())? {
            LockOutcome::ParentRemoved => {
                tracing::debug!(ruleset = %target.identifier.ruleset_id, "affected level vanished before locking");
            }
            _ => locked.push(LockedTarget { target, locker }),
        }
    }
    Ok(locked)
}

/// The level that shows `identifier`'s nodes: virtual parents are skipped.
/// `None` when the parent node is gone.
fn physical_target(
    txn: &CacheTxn<'_>,
    identifier: HierarchyLevelIdentifier,
) -> Result<Option<RefreshTarget>, CacheError> {
    let Some(parent_id) = identifier.parent_node_id else {
        return Ok(Some(RefreshTarget::root(identifier)));
    };
    if txn.get_node(parent_id)?.is_none() {
        return Ok(None);
    }
    Ok(Some(match txn.resolve_physical_node(parent_id)? {
        Some(parent) => RefreshTarget {
            identifier: identifier.with_parent(parent.id),
            parent_key: Some(parent.key.clone()),
            parent_variables: match parent.id {
                Some(id) => node_variables(txn, id)?,
                None => RulesetVariables::new(),
            },
        },
        None => RefreshTarget::root(identifier.with_parent(None)),
    }))
}

/// Union of the variables of every data source that produced `node_id`.
pub(crate) fn node_variables(
    txn: &CacheTxn<'_>,
    node_id: NodeId,
) -> Result<RulesetVariables, CacheError> {
    let mut sets = Vec::new();
    for (data_source_id, _, _) in txn.node_associations(node_id)? {
        if let Some(info) = txn.get_data_source(data_source_id)? {
            sets.push(info.variables);
        }
    }
    Ok(merge_variables(sets))
}

pub(crate) fn merge_variables(
    sets: impl IntoIterator<Item = RulesetVariables>,
) -> RulesetVariables {
    let mut merged = RulesetVariables::new();
    for set in sets {
        for (id, value) in set.iter() {
            merged.set(id.clone(), value.clone());
        }
    }
    merged
}

/// Keep only the topmost targets per ruleset, root levels first.
pub(crate) fn prune_nested(mut targets: Vec<RefreshTarget>) -> Vec<RefreshTarget> {
    targets.sort_by_key(|target| target.parent_path().depth());
    let mut kept: Vec<RefreshTarget> = Vec::new();
    for target in targets {
        let path = target.parent_path();
        let covered = kept.iter().any(|k| {
            k.identifier.ruleset_id == target.identifier.ruleset_id
                && (k.identifier == target.identifier || k.parent_path().is_strict_prefix_of(&path))
        });
        if !covered {
            kept.push(target);
        }
    }
    kept
}
