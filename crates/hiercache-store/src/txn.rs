//! Transaction-scoped cache operations: rulesets, variables, hierarchy
//! levels and data sources.
//!
//! A [`CacheTxn`] is only handed out by [`crate::NodesCache`] while the
//! connection mutex is held, so every method here runs serialized with
//! respect to the rest of the process. Node, relation and lock queries
//! live in sibling modules as further `impl CacheTxn` blocks.

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hot::HotNodeCache;
use crate::maintenance;
use crate::sql::{from_sql_int, get_id, get_opt_id, opt_text, to_sql_int};
use chrono::Utc;
use hiercache_kernel::{
    ClassId, DataSourceFilter, DataSourceId, DataSourceIdentifier, DataSourceInfo,
    DataSourceParts, HierarchyLevelId, HierarchyLevelIdentifier, HierarchyLevelInfo, NewDataSource,
    NodeId, NodeIndex, RemovalId, RulesetId, RulesetVariables, VariablesId,
};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::BTreeMap;

pub struct CacheTxn<'a> {
    conn: &'a Connection,
    hot: &'a HotNodeCache,
    connection_id: &'a str,
    config: &'a CacheConfig,
}

/// What `on_ruleset_used` did with the stored ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesetUse {
    Created(RulesetId),
    Reused(RulesetId),
    /// The stored hash differed; everything cached for it was dropped.
    Replaced(RulesetId),
}

impl RulesetUse {
    pub fn id(self) -> RulesetId {
        match self {
            RulesetUse::Created(id) | RulesetUse::Reused(id) | RulesetUse::Replaced(id) => id,
        }
    }
}

pub(crate) const LEVEL_COLUMNS: &str =
    "hl.id, r.identifier, hl.parent_node_id, hl.removal_id, hl.lock_timestamp";

const DATA_SOURCE_COLUMNS: &str = "ds.id, ds.hierarchy_level_id, ds.ordering_index, ds.parent_id, \
     ds.filter, v.variables, ds.specification_hash, ds.node_types, ds.has_nodes, \
     ds.direct_nodes_count, ds.total_nodes_count, ds.is_initialized, ds.custom_json";

struct DataSourceRow {
    id: DataSourceId,
    hierarchy_level_id: HierarchyLevelId,
    ordering_index: String,
    parent_id: Option<DataSourceId>,
    filter: String,
    variables: String,
    specification_hash: String,
    node_types: String,
    has_nodes: Option<bool>,
    direct_nodes_count: Option<i64>,
    total_nodes_count: Option<i64>,
    is_initialized: bool,
    custom_json: String,
}

impl DataSourceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: get_id(row, 0)?,
            hierarchy_level_id: get_id(row, 1)?,
            ordering_index: row.get(2)?,
            parent_id: get_opt_id(row, 3)?,
            filter: row.get(4)?,
            variables: row.get(5)?,
            specification_hash: row.get(6)?,
            node_types: row.get(7)?,
            has_nodes: row.get(8)?,
            direct_nodes_count: row.get(9)?,
            total_nodes_count: row.get(10)?,
            is_initialized: row.get(11)?,
            custom_json: row.get(12)?,
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn opt_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

impl<'a> CacheTxn<'a> {
    pub(crate) fn new(
        conn: &'a Connection,
        hot: &'a HotNodeCache,
        connection_id: &'a str,
        config: &'a CacheConfig,
    ) -> Self {
        Self {
            conn,
            hot,
            connection_id,
            config,
        }
    }

    pub fn connection_id(&self) -> &str {
        self.connection_id
    }

    pub(crate) fn conn(&self) -> &Connection {
        self.conn
    }

    pub(crate) fn hot(&self) -> &HotNodeCache {
        self.hot
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        self.config
    }

    pub(crate) fn read_level(&self, row: &Row<'_>) -> rusqlite::Result<HierarchyLevelInfo> {
        Ok(HierarchyLevelInfo {
            id: get_id(row, 0)?,
            identifier: HierarchyLevelIdentifier {
                connection_id: self.connection_id.to_string(),
                ruleset_id: row.get(1)?,
                parent_node_id: get_opt_id(row, 2)?,
                removal_id: get_opt_id(row, 3)?,
            },
            lock_timestamp: row.get(4)?,
        })
    }

    // Rulesets and variables

    /// Record that a ruleset with content `hash` is in use.
    ///
    /// A stored ruleset with a different hash is deleted together with
    /// everything cached for it. The size budget is enforced afterwards.
    pub fn on_ruleset_used(&self, identifier: &str, hash: &str) -> Result<RulesetUse, CacheError> {
        let now = now_ms();
        let existing: Option<(RulesetId, String)> = self
            .conn
            .prepare_cached("SELECT id, hash FROM rulesets WHERE identifier = ?1")?
            .query_row(params![identifier], |row| Ok((get_id(row, 0)?, row.get(1)?)))
            .optional()?;

        let outcome = match existing {
            Some((id, stored)) if stored == hash || stored.is_empty() => {
                self.conn.execute(
                    "UPDATE rulesets SET hash = ?2, last_used_time = ?3 WHERE id = ?1",
                    params![id.to_string(), hash, now],
                )?;
                RulesetUse::Reused(id)
            }
            Some((id, stored)) => {
                tracing::info!(ruleset = identifier, stored = %stored, hash, "ruleset changed, dropping its hierarchies");
                self.conn
                    .execute("DELETE FROM rulesets WHERE id = ?1", params![id.to_string()])?;
                self.hot.clear();
                RulesetUse::Replaced(self.insert_ruleset(identifier, hash, now)?)
            }
            None => RulesetUse::Created(self.insert_ruleset(identifier, hash, now)?),
        };
        maintenance::limit_cache_size(self.conn, self.config.size_limit)?;
        Ok(outcome)
    }

    fn insert_ruleset(&self, identifier: &str, hash: &str, now: i64) -> Result<RulesetId, CacheError> {
        let id = RulesetId::generate();
        self.conn.execute(
            "INSERT INTO rulesets (id, identifier, hash, last_used_time) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), identifier, hash, now],
        )?;
        Ok(id)
    }

    /// Row id of a ruleset, creating a hash-less row when it is unknown.
    pub(crate) fn ensure_ruleset(&self, identifier: &str) -> Result<RulesetId, CacheError> {
        let found: Option<RulesetId> = self
            .conn
            .prepare_cached("SELECT id FROM rulesets WHERE identifier = ?1")?
            .query_row(params![identifier], |row| get_id(row, 0))
            .optional()?;
        match found {
            Some(id) => Ok(id),
            None => self.insert_ruleset(identifier, "", now_ms()),
        }
    }

    /// Refresh the last-used time of every stored variable set of the
    /// ruleset that `variables` contains.
    pub fn on_variables_used(
        &self,
        ruleset_id: &str,
        variables: &RulesetVariables,
    ) -> Result<usize, CacheError> {
        let touched = self.conn.execute(
            "UPDATE variables SET last_used_time = ?3
              WHERE ruleset_id = (SELECT id FROM rulesets WHERE identifier = ?1)
                AND variables_match(variables, ?2, 0)",
            params![ruleset_id, variables.to_storage_string(), now_ms()],
        )?;
        Ok(touched)
    }

    fn cache_variables(
        &self,
        ruleset_row: &RulesetId,
        variables: &RulesetVariables,
    ) -> Result<VariablesId, CacheError> {
        let serialized = variables.to_storage_string();
        let found: Option<VariablesId> = self
            .conn
            .prepare_cached(
                "SELECT id FROM variables WHERE ruleset_id = ?1 AND variables_match(variables, ?2, 1)",
            )?
            .query_row(params![ruleset_row.to_string(), serialized], |row| {
                get_id(row, 0)
            })
            .optional()?;
        if let Some(id) = found {
            return Ok(id);
        }
        let id = VariablesId::generate();
        self.conn.execute(
            "INSERT INTO variables (id, ruleset_id, variables, last_used_time) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), ruleset_row.to_string(), serialized, now_ms()],
        )?;
        Ok(id)
    }

    // Hierarchy levels

    /// Id of the level `(parent, ruleset, removal_id)`, inserting it if
    /// missing. Repeated calls return the same id.
    pub fn create_or_get_hierarchy_level(
        &self,
        parent_node_id: Option<NodeId>,
        ruleset_id: &str,
        removal_id: Option<RemovalId>,
    ) -> Result<HierarchyLevelId, CacheError> {
        let ruleset_row = self.ensure_ruleset(ruleset_id)?;
        let parent = opt_text(parent_node_id.as_ref());
        let removal = opt_text(removal_id.as_ref());
        let found: Option<HierarchyLevelId> = self
            .conn
            .prepare_cached(
                "SELECT id FROM hierarchy_levels
                  WHERE parent_node_id IS ?1 AND ruleset_id = ?2 AND removal_id IS ?3",
            )?
            .query_row(params![parent, ruleset_row.to_string(), removal], |row| {
                get_id(row, 0)
            })
            .optional()?;
        if let Some(id) = found {
            return Ok(id);
        }
        let id = HierarchyLevelId::generate();
        self.conn.execute(
            "INSERT INTO hierarchy_levels (id, parent_node_id, ruleset_id, removal_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), parent, ruleset_row.to_string(), removal],
        )?;
        tracing::trace!(level = %id, ruleset = ruleset_id, "created hierarchy level");
        Ok(id)
    }

    pub fn find_hierarchy_level(
        &self,
        identifier: &HierarchyLevelIdentifier,
    ) -> Result<Option<HierarchyLevelInfo>, CacheError> {
        let sql = format!(
            "SELECT {LEVEL_COLUMNS} FROM hierarchy_levels hl JOIN rulesets r ON r.id = hl.ruleset_id
              WHERE hl.parent_node_id IS ?1 AND r.identifier = ?2 AND hl.removal_id IS ?3"
        );
        Ok(self
            .conn
            .prepare_cached(&sql)?
            .query_row(
                params![
                    opt_text(identifier.parent_node_id.as_ref()),
                    identifier.ruleset_id,
                    opt_text(identifier.removal_id.as_ref())
                ],
                |row| self.read_level(row),
            )
            .optional()?)
    }

    pub fn get_hierarchy_level(
        &self,
        id: HierarchyLevelId,
    ) -> Result<Option<HierarchyLevelInfo>, CacheError> {
        let sql = format!(
            "SELECT {LEVEL_COLUMNS} FROM hierarchy_levels hl JOIN rulesets r ON r.id = hl.ruleset_id
              WHERE hl.id = ?1"
        );
        Ok(self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id.to_string()], |row| self.read_level(row))
            .optional()?)
    }

    /// The level that contains `node_id`.
    pub fn get_parent_hierarchy_level(
        &self,
        node_id: NodeId,
    ) -> Result<Option<HierarchyLevelInfo>, CacheError> {
        let sql = format!(
            "SELECT {LEVEL_COLUMNS} FROM nodes n
               JOIN hierarchy_levels hl ON hl.id = n.hierarchy_level_id
               JOIN rulesets r ON r.id = hl.ruleset_id
              WHERE n.id = ?1"
        );
        Ok(self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![node_id.to_string()], |row| self.read_level(row))
            .optional()?)
    }

    /// True only when at least one data source of the level matches
    /// `variables` and every matching one is initialized.
    pub fn is_hierarchy_level_initialized(
        &self,
        level_id: HierarchyLevelId,
        variables: &RulesetVariables,
    ) -> Result<bool, CacheError> {
        let (total, initialized): (i64, i64) = self
            .conn
            .prepare_cached(
                "SELECT COUNT(*), COALESCE(SUM(ds.is_initialized), 0)
                   FROM data_sources ds JOIN variables v ON v.id = ds.variables_id
                  WHERE ds.hierarchy_level_id = ?1 AND variables_match(v.variables, ?2, 0)",
            )?
            .query_row(
                params![level_id.to_string(), variables.to_storage_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
        Ok(total > 0 && total == initialized)
    }

    /// The level was built for some variation, but none that `variables`
    /// satisfies.
    pub fn might_have_new_variation(
        &self,
        level_id: HierarchyLevelId,
        variables: &RulesetVariables,
    ) -> Result<bool, CacheError> {
        let (total, matching): (i64, i64) = self
            .conn
            .prepare_cached(
                "SELECT COUNT(*), COALESCE(SUM(variables_match(v.variables, ?2, 0)), 0)
                   FROM data_sources ds JOIN variables v ON v.id = ds.variables_id
                  WHERE ds.hierarchy_level_id = ?1",
            )?
            .query_row(
                params![level_id.to_string(), variables.to_storage_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
        Ok(total > 0 && matching == 0)
    }

    // Data sources

    /// Insert a not-yet-initialized data source and return its id.
    pub fn reserve_data_source(&self, new: &NewDataSource) -> Result<DataSourceId, CacheError> {
        let ruleset_row: Option<RulesetId> = self
            .conn
            .prepare_cached("SELECT ruleset_id FROM hierarchy_levels WHERE id = ?1")?
            .query_row(
                params![new.identifier.hierarchy_level_id.to_string()],
                |row| get_id(row, 0),
            )
            .optional()?;
        let ruleset_row = ruleset_row.ok_or_else(|| {
            CacheError::Inconsistent(format!(
                "data source reserved for missing level {}",
                new.identifier.hierarchy_level_id
            ))
        })?;
        let variables_id = self.cache_variables(&ruleset_row, &new.variables)?;

        let id = DataSourceId::generate();
        self.conn.execute(
            "INSERT INTO data_sources (id, hierarchy_level_id, parent_id, ordering_index, variables_id,
                                       instance_filter, filter, specification_hash, node_types, custom_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.to_string(),
                new.identifier.hierarchy_level_id.to_string(),
                opt_text(new.identifier.parent_id.as_ref()),
                new.identifier.ordering_index.to_storage_string(),
                variables_id.to_string(),
                new.filter.instance_filter,
                serde_json::to_string(&new.filter)?,
                new.specification_hash,
                new.node_types,
                new.custom_json,
            ],
        )?;
        self.write_related_classes(id, &new.related_classes)?;
        Ok(id)
    }

    fn write_related_classes(
        &self,
        id: DataSourceId,
        classes: &BTreeMap<ClassId, bool>,
    ) -> Result<(), CacheError> {
        self.conn.execute(
            "DELETE FROM data_source_classes WHERE data_source_id = ?1",
            params![id.to_string()],
        )?;
        let mut insert = self.conn.prepare_cached(
            "INSERT INTO data_source_classes (data_source_id, class_id, polymorphic) VALUES (?1, ?2, ?3)",
        )?;
        for (class_id, polymorphic) in classes {
            insert.execute(params![id.to_string(), to_sql_int(class_id.0), polymorphic])?;
        }
        Ok(())
    }

    fn related_classes(&self, id: DataSourceId) -> Result<BTreeMap<ClassId, bool>, CacheError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT class_id, polymorphic FROM data_source_classes WHERE data_source_id = ?1",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok((ClassId(from_sql_int(row.get(0)?)), row.get::<_, bool>(1)?))
        })?;
        let mut classes = BTreeMap::new();
        for row in rows {
            let (class_id, polymorphic) = row?;
            classes.insert(class_id, polymorphic);
        }
        Ok(classes)
    }

    fn data_source_info(&self, row: DataSourceRow) -> Result<DataSourceInfo, CacheError> {
        let filter: DataSourceFilter = if row.filter.trim().is_empty() {
            DataSourceFilter::default()
        } else {
            serde_json::from_str(&row.filter)?
        };
        Ok(DataSourceInfo {
            id: row.id,
            identifier: DataSourceIdentifier {
                hierarchy_level_id: row.hierarchy_level_id,
                ordering_index: NodeIndex::from_storage_string(&row.ordering_index)?,
                parent_id: row.parent_id,
            },
            filter,
            variables: RulesetVariables::from_storage_string(&row.variables)?,
            specification_hash: row.specification_hash,
            node_types: row.node_types,
            has_nodes: row.has_nodes,
            direct_nodes_count: row.direct_nodes_count.map(from_sql_int),
            total_nodes_count: row.total_nodes_count.map(from_sql_int),
            is_initialized: row.is_initialized,
            custom_json: row.custom_json,
            related_classes: self.related_classes(row.id)?,
        })
    }

    fn query_data_sources(
        &self,
        filter_sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DataSourceInfo>, CacheError> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources ds JOIN variables v ON v.id = ds.variables_id
              WHERE {filter_sql}"
        );
        let rows: Vec<DataSourceRow> = self
            .conn
            .prepare_cached(&sql)?
            .query_map(params, DataSourceRow::read)?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|row| self.data_source_info(row))
            .collect()
    }

    pub fn get_data_source(&self, id: DataSourceId) -> Result<Option<DataSourceInfo>, CacheError> {
        Ok(self
            .query_data_sources("ds.id = ?1", params![id.to_string()])?
            .into_iter()
            .next())
    }

    /// The data source at `ordering_index` whose stored variables are
    /// satisfied by `variables`; the most specific one wins.
    pub fn find_data_source(
        &self,
        level_id: HierarchyLevelId,
        ordering_index: &NodeIndex,
        variables: &RulesetVariables,
    ) -> Result<Option<DataSourceInfo>, CacheError> {
        Ok(self
            .query_data_sources(
                "ds.hierarchy_level_id = ?1 AND ds.ordering_index = ?2
                   AND variables_match(v.variables, ?3, 0)
                 ORDER BY LENGTH(v.variables) DESC LIMIT 1",
                params![
                    level_id.to_string(),
                    ordering_index.to_storage_string(),
                    variables.to_storage_string()
                ],
            )?
            .into_iter()
            .next())
    }

    /// Every data source of the level usable with `variables`, in order.
    pub fn find_data_sources(
        &self,
        level_id: HierarchyLevelId,
        variables: &RulesetVariables,
    ) -> Result<Vec<DataSourceInfo>, CacheError> {
        self.query_data_sources(
            "ds.hierarchy_level_id = ?1 AND variables_match(v.variables, ?2, 0)
             ORDER BY ds.ordering_index",
            params![level_id.to_string(), variables.to_storage_string()],
        )
    }

    /// Every data source of the level, whatever variables built it.
    pub fn level_data_sources(
        &self,
        level_id: HierarchyLevelId,
    ) -> Result<Vec<DataSourceInfo>, CacheError> {
        self.query_data_sources(
            "ds.hierarchy_level_id = ?1 ORDER BY ds.ordering_index",
            params![level_id.to_string()],
        )
    }

    /// Write the selected parts of `info` back to its row.
    pub fn update_data_source(
        &self,
        info: &DataSourceInfo,
        parts: DataSourceParts,
    ) -> Result<(), CacheError> {
        let mut columns: Vec<(&str, Value)> = Vec::new();
        if parts.contains(DataSourceParts::FILTER) {
            columns.push(("filter", Value::Text(serde_json::to_string(&info.filter)?)));
            columns.push(("instance_filter", Value::Text(info.filter.instance_filter.clone())));
        }
        if parts.contains(DataSourceParts::VARIABLES) {
            let level = self
                .get_hierarchy_level(info.identifier.hierarchy_level_id)?
                .ok_or_else(|| {
                    CacheError::Inconsistent(format!("data source {} has no level", info.id))
                })?;
            let ruleset_row = self.ensure_ruleset(&level.identifier.ruleset_id)?;
            let variables_id = self.cache_variables(&ruleset_row, &info.variables)?;
            columns.push(("variables_id", Value::Text(variables_id.to_string())));
        }
        if parts.contains(DataSourceParts::HAS_NODES) {
            columns.push(("has_nodes", opt_int(info.has_nodes.map(i64::from))));
        }
        if parts.contains(DataSourceParts::DIRECT_NODES_COUNT) {
            columns.push((
                "direct_nodes_count",
                opt_int(info.direct_nodes_count.map(to_sql_int)),
            ));
        }
        if parts.contains(DataSourceParts::TOTAL_NODES_COUNT) {
            columns.push((
                "total_nodes_count",
                opt_int(info.total_nodes_count.map(to_sql_int)),
            ));
        }
        if parts.contains(DataSourceParts::IS_INITIALIZED) {
            columns.push(("is_initialized", Value::Integer(i64::from(info.is_initialized))));
        }
        if parts.contains(DataSourceParts::SPECIFICATION_HASH) {
            columns.push(("specification_hash", Value::Text(info.specification_hash.clone())));
        }
        if parts.contains(DataSourceParts::NODE_TYPES) {
            columns.push(("node_types", Value::Text(info.node_types.clone())));
        }
        if parts.contains(DataSourceParts::CUSTOM_JSON) {
            columns.push(("custom_json", Value::Text(info.custom_json.clone())));
        }

        if !columns.is_empty() {
            let assignments: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
                .collect();
            let sql = format!(
                "UPDATE data_sources SET {} WHERE id = ?{}",
                assignments.join(", "),
                columns.len() + 1
            );
            let mut values: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
            values.push(Value::Text(info.id.to_string()));
            let updated = self.conn.execute(&sql, params_from_iter(values))?;
            if updated == 0 {
                return Err(CacheError::Inconsistent(format!(
                    "data source {} does not exist",
                    info.id
                )));
            }
        }
        if parts.contains(DataSourceParts::RELATED_CLASSES) {
            self.write_related_classes(info.id, &info.related_classes)?;
        }
        Ok(())
    }

    /// Delete a data source. Nodes no other data source references go with it.
    pub fn reset_data_source(&self, id: DataSourceId) -> Result<(), CacheError> {
        self.conn
            .execute("DELETE FROM data_sources WHERE id = ?1", params![id.to_string()])?;
        self.hot.clear();
        Ok(())
    }

    /// Whether any data source is nested under `id`.
    pub fn has_child_data_sources(&self, id: DataSourceId) -> Result<bool, CacheError> {
        Ok(self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM data_sources WHERE parent_id = ?1)")?
            .query_row(params![id.to_string()], |row| row.get(0))?)
    }

    // Whole-cache operations

    /// Drop every cached hierarchy, or only those of one ruleset.
    pub fn clear(&self, ruleset_id: Option<&str>) -> Result<(), CacheError> {
        match ruleset_id {
            Some(identifier) => {
                self.conn
                    .execute("DELETE FROM rulesets WHERE identifier = ?1", params![identifier])?;
            }
            None => {
                self.conn.execute("DELETE FROM rulesets", [])?;
            }
        }
        self.hot.clear();
        tracing::debug!(ruleset = ruleset_id.unwrap_or("*"), "cleared hierarchy cache");
        Ok(())
    }

    pub fn count_rows(&self, table: &str) -> Result<u64, CacheError> {
        crate::schema::count_rows(self.conn, table)
    }
}
