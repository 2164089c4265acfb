//! Finding levels affected by data changes, and retiring subtrees.

use crate::error::CacheError;
use crate::source::SourceConnection;
use crate::sql::{get_opt_id, opt_text, to_sql_int};
use crate::txn::CacheTxn;
use hiercache_kernel::{
    ClassId, DataSourceFilter, HierarchyLevelIdentifier, InstanceKey, NodeId, RemovalId,
};
use rusqlite::params;
use std::collections::{BTreeMap, BTreeSet};

fn json_array<T: serde::Serialize>(values: &T) -> Result<String, CacheError> {
    Ok(serde_json::to_string(values)?)
}

impl CacheTxn<'_> {
    /// Live levels whose content may change when `keys` change.
    ///
    /// A level is related when one of its data sources was built from a
    /// class of a changed instance (polymorphically through base and
    /// derived classes when the data source asked for that), or when one
    /// of its nodes represents a changed instance. Class matches whose
    /// data source carries an instance or relationship filter are vetted
    /// by the source so unrelated instances do not trigger refreshes.
    pub fn get_related_hierarchy_levels(
        &self,
        source: &dyn SourceConnection,
        keys: &[InstanceKey],
    ) -> Result<BTreeSet<HierarchyLevelIdentifier>, CacheError> {
        let mut levels = BTreeSet::new();
        if keys.is_empty() {
            return Ok(levels);
        }

        let exact: BTreeSet<ClassId> = keys.iter().map(|key| key.class_id).collect();
        let mut polymorphic = exact.clone();
        for class_id in &exact {
            polymorphic.extend(source.related_classes(*class_id));
        }
        let exact_json = json_array(&exact.iter().map(|c| to_sql_int(c.0)).collect::<Vec<_>>())?;
        let polymorphic_json =
            json_array(&polymorphic.iter().map(|c| to_sql_int(c.0)).collect::<Vec<_>>())?;

        // Class matches, grouped by data source so each filter is vetted once.
        let mut by_filter: BTreeMap<(String, Option<NodeId>, String), Vec<InstanceKey>> =
            BTreeMap::new();
        let candidates: Vec<(String, Option<NodeId>, String, i64, bool)> = self
            .conn()
            .prepare_cached(
                "SELECT r.identifier, hl.parent_node_id, ds.filter, dsc.class_id, dsc.polymorphic
                   FROM data_source_classes dsc
                   JOIN data_sources ds ON ds.id = dsc.data_source_id
                   JOIN hierarchy_levels hl ON hl.id = ds.hierarchy_level_id
                   JOIN rulesets r ON r.id = hl.ruleset_id
                  WHERE hl.removal_id IS NULL
                    AND ((dsc.polymorphic AND dsc.class_id IN (SELECT value FROM json_each(?1)))
                      OR (NOT dsc.polymorphic AND dsc.class_id IN (SELECT value FROM json_each(?2))))",
            )?
            .query_map(params![polymorphic_json, exact_json], |row| {
                Ok((
                    row.get(0)?,
                    get_opt_id(row, 1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        for (ruleset_id, parent_node_id, filter, class_id, is_polymorphic) in candidates {
            let matching: Vec<InstanceKey> = keys
                .iter()
                .filter(|key| {
                    let key_class = to_sql_int(key.class_id.0);
                    key_class == class_id
                        || (is_polymorphic
                            && source
                                .related_classes(key.class_id)
                                .iter()
                                .any(|related| to_sql_int(related.0) == class_id))
                })
                .copied()
                .collect();
            by_filter
                .entry((ruleset_id, parent_node_id, filter))
                .or_default()
                .extend(matching);
        }

        for ((ruleset_id, parent_node_id, filter_json), mut matched) in by_filter {
            let filter: DataSourceFilter = if filter_json.trim().is_empty() {
                DataSourceFilter::default()
            } else {
                serde_json::from_str(&filter_json)?
            };
            if filter.is_restrictive() {
                matched.sort();
                matched.dedup();
                if !source.any_key_matches_filter(&filter, &matched)? {
                    continue;
                }
            }
            levels.insert(HierarchyLevelIdentifier::live(
                self.connection_id(),
                ruleset_id,
                parent_node_id,
            ));
        }

        // Direct instance matches are always affected.
        let key_pairs = json_array(
            &keys
                .iter()
                .map(|key| (to_sql_int(key.class_id.0), to_sql_int(key.instance_id.0)))
                .collect::<Vec<_>>(),
        )?;
        let direct: Vec<(String, Option<NodeId>)> = self
            .conn()
            .prepare_cached(
                "SELECT DISTINCT r.identifier, hl.parent_node_id
                   FROM node_instances ni
                   JOIN nodes n ON n.id = ni.node_id
                   JOIN hierarchy_levels hl ON hl.id = n.hierarchy_level_id
                   JOIN rulesets r ON r.id = hl.ruleset_id
                  WHERE hl.removal_id IS NULL
                    AND (ni.class_id, ni.instance_id) IN (
                        SELECT json_extract(value, '$[0]'), json_extract(value, '$[1]')
                          FROM json_each(?1))",
            )?
            .query_map(params![key_pairs], |row| Ok((row.get(0)?, get_opt_id(row, 1)?)))?
            .collect::<Result<_, _>>()?;
        for (ruleset_id, parent_node_id) in direct {
            levels.insert(HierarchyLevelIdentifier::live(
                self.connection_id(),
                ruleset_id,
                parent_node_id,
            ));
        }

        tracing::debug!(keys = keys.len(), levels = levels.len(), "related hierarchy levels");
        Ok(levels)
    }

    /// Live levels of `ruleset_id` built by data sources whose stored
    /// variables mention `variable_id`.
    pub fn get_levels_using_variable(
        &self,
        ruleset_id: &str,
        variable_id: &str,
    ) -> Result<BTreeSet<HierarchyLevelIdentifier>, CacheError> {
        let rows: Vec<Option<NodeId>> = self
            .conn()
            .prepare_cached(
                "SELECT DISTINCT hl.parent_node_id
                   FROM data_sources ds
                   JOIN variables v ON v.id = ds.variables_id
                   JOIN hierarchy_levels hl ON hl.id = ds.hierarchy_level_id
                   JOIN rulesets r ON r.id = hl.ruleset_id
                  WHERE r.identifier = ?1 AND hl.removal_id IS NULL
                    AND EXISTS (SELECT 1 FROM json_each(v.variables) WHERE key = ?2)",
            )?
            .query_map(params![ruleset_id, variable_id], |row| get_opt_id(row, 0))?
            .collect::<Result<_, _>>()?;
        Ok(rows
            .into_iter()
            .map(|parent| HierarchyLevelIdentifier::live(self.connection_id(), ruleset_id, parent))
            .collect())
    }

    /// Tombstone the live level `identifier` and every live level below
    /// it with one fresh removal id. Returns `None` when no such level is
    /// cached.
    pub fn soft_delete_subtree(
        &self,
        identifier: &HierarchyLevelIdentifier,
    ) -> Result<Option<RemovalId>, CacheError> {
        let removal_id = RemovalId::generate();
        let retired = self
            .conn()
            .prepare_cached(
                "WITH RECURSIVE subtree(level_id) AS (
                     SELECT hl.id FROM hierarchy_levels hl JOIN rulesets r ON r.id = hl.ruleset_id
                      WHERE hl.parent_node_id IS ?1 AND r.identifier = ?2 AND hl.removal_id IS NULL
                     UNION
                     SELECT child.id FROM subtree
                       JOIN nodes n ON n.hierarchy_level_id = subtree.level_id
                       JOIN hierarchy_levels child ON child.parent_node_id = n.id
                      WHERE child.removal_id IS NULL
                 )
                 UPDATE hierarchy_levels SET removal_id = ?3
                  WHERE id IN (SELECT level_id FROM subtree)",
            )?
            .execute(params![
                opt_text(identifier.parent_node_id.as_ref()),
                identifier.ruleset_id,
                removal_id.to_string()
            ])?;
        self.hot().clear();
        if retired == 0 {
            return Ok(None);
        }
        tracing::debug!(
            ruleset = %identifier.ruleset_id,
            removal = %removal_id,
            levels = retired,
            "soft-deleted hierarchy subtree"
        );
        Ok(Some(removal_id))
    }

    /// Physically delete everything tombstoned with `removal_id`.
    pub fn hard_delete(&self, removal_id: RemovalId) -> Result<usize, CacheError> {
        let removed = self
            .conn()
            .prepare_cached("DELETE FROM hierarchy_levels WHERE removal_id = ?1")?
            .execute(params![removal_id.to_string()])?;
        self.hot().clear();
        tracing::debug!(removal = %removal_id, levels = removed, "hard-deleted hierarchy subtree");
        Ok(removed)
    }
}
