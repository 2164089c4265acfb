//! Node storage: caching, reading, locating and visibility.

use crate::error::CacheError;
use crate::functions::split_id_list;
use crate::sql::{from_sql_int, get_id, get_opt_id, to_sql_int};
use crate::txn::CacheTxn;
use hiercache_kernel::{
    ClassId, DataSourceId, GroupedInstances, HashPath, HierarchyLevelId, InstanceKey, KernelError,
    NavNode, NodeId, NodeIndex, NodeKey, NodeKeyKind, NodeVisibility, RulesetVariables,
    TYPE_CLASS_GROUPING, TYPE_INSTANCES, TYPE_LABEL_GROUPING, TYPE_PROPERTY_GROUPING,
};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Columns read for every node, in `NodeRow::read` order.
pub(crate) const NODE_COLUMNS: &str = "n.id, n.data, n.label, n.instance_keys_query, hl.parent_node_id, \
     k.type, k.specification_id, k.class_id, k.is_polymorphic, k.property_name, k.grouping_values, \
     k.grouped_instance_count, k.grouped_instance_keys, k.path_from_root, \
     (SELECT json_group_array(json_array(ni.class_id, ni.instance_id)) FROM node_instances ni WHERE ni.node_id = n.id), \
     (SELECT id_concat(mn.merged_node_id) FROM merged_nodes mn WHERE mn.merging_node_id = n.id)";

/// Joins `NODE_COLUMNS` needs.
pub(crate) const NODE_JOINS: &str = "JOIN node_keys k ON k.node_id = n.id \
     JOIN hierarchy_levels hl ON hl.id = n.hierarchy_level_id";

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodePayload {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    extended_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    has_children: Option<bool>,
}

pub(crate) struct NodeRow {
    id: NodeId,
    data: String,
    label: String,
    instance_keys_query: Option<String>,
    parent_id: Option<NodeId>,
    node_type: String,
    specification_id: String,
    class_id: Option<i64>,
    is_polymorphic: Option<bool>,
    property_name: Option<String>,
    grouping_values: Option<String>,
    grouped_instance_count: Option<i64>,
    grouped_instance_keys: Option<String>,
    path_from_root: String,
    instance_keys: Option<String>,
    merged_ids: Option<String>,
}

impl NodeRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: get_id(row, 0)?,
            data: row.get(1)?,
            label: row.get(2)?,
            instance_keys_query: row.get(3)?,
            parent_id: get_opt_id(row, 4)?,
            node_type: row.get(5)?,
            specification_id: row.get(6)?,
            class_id: row.get(7)?,
            is_polymorphic: row.get(8)?,
            property_name: row.get(9)?,
            grouping_values: row.get(10)?,
            grouped_instance_count: row.get(11)?,
            grouped_instance_keys: row.get(12)?,
            path_from_root: row.get(13)?,
            instance_keys: row.get(14)?,
            merged_ids: row.get(15)?,
        })
    }

    fn missing(&self, column: &str) -> KernelError {
        KernelError::InvalidKey(format!(
            "{} node {} has no {column}",
            self.node_type, self.id
        ))
    }

    fn grouped(&self) -> Result<GroupedInstances, CacheError> {
        let keys = match &self.grouped_instance_keys {
            Some(text) => Some(serde_json::from_str::<Vec<InstanceKey>>(text)?),
            None => None,
        };
        Ok(GroupedInstances {
            count: self.grouped_instance_count.map(from_sql_int).unwrap_or(0),
            keys,
        })
    }

    fn class_id(&self) -> Result<ClassId, CacheError> {
        self.class_id
            .map(|id| ClassId(from_sql_int(id)))
            .ok_or_else(|| self.missing("class id").into())
    }

    fn kind(&self) -> Result<NodeKeyKind, CacheError> {
        Ok(match self.node_type.as_str() {
            TYPE_INSTANCES => {
                let pairs: Vec<(u64, u64)> = match &self.instance_keys {
                    Some(text) => serde_json::from_str(text)?,
                    None => Vec::new(),
                };
                let mut instance_keys: Vec<InstanceKey> = pairs
                    .into_iter()
                    .map(|(class_id, instance_id)| InstanceKey::new(class_id, instance_id))
                    .collect();
                instance_keys.sort();
                NodeKeyKind::Instances { instance_keys }
            }
            TYPE_CLASS_GROUPING => NodeKeyKind::ClassGrouping {
                class_id: self.class_id()?,
                is_polymorphic: self.is_polymorphic.unwrap_or(false),
                grouped: self.grouped()?,
            },
            TYPE_PROPERTY_GROUPING => NodeKeyKind::PropertyGrouping {
                class_id: self.class_id()?,
                property_name: self
                    .property_name
                    .clone()
                    .ok_or_else(|| self.missing("property name"))?,
                grouping_values: match &self.grouping_values {
                    Some(text) => serde_json::from_str(text)?,
                    None => Vec::new(),
                },
                grouped: self.grouped()?,
            },
            TYPE_LABEL_GROUPING => NodeKeyKind::LabelGrouping {
                label: match &self.grouping_values {
                    Some(text) => serde_json::from_str(text)?,
                    None => return Err(self.missing("grouping label").into()),
                },
                grouped: self.grouped()?,
            },
            other => NodeKeyKind::Other {
                node_type: other.to_string(),
            },
        })
    }

    pub(crate) fn into_node(self) -> Result<NavNode, CacheError> {
        let kind = self.kind()?;
        let payload: NodePayload = if self.data.trim().is_empty() {
            NodePayload::default()
        } else {
            serde_json::from_str(&self.data)?
        };
        let merged_node_ids = split_id_list(self.merged_ids.as_deref())
            .map(|id| id.parse::<NodeId>())
            .collect::<Result<Vec<_>, _>>()?;
        let key = NodeKey::from_parts(
            self.specification_id,
            kind,
            HashPath::from_storage_string(&self.path_from_root)?,
        );
        Ok(NavNode {
            id: Some(self.id),
            parent_id: self.parent_id,
            key,
            label: self.label,
            extended_data: payload.extended_data,
            instance_keys_query: self.instance_keys_query,
            merged_node_ids,
            has_children: payload.has_children,
        })
    }
}

/// Key columns other than type, spec and path, in insert order.
struct KeyColumns {
    class_id: Option<i64>,
    is_polymorphic: Option<bool>,
    property_name: Option<String>,
    grouping_values: Option<String>,
    grouped_instance_count: Option<i64>,
    grouped_instance_keys: Option<String>,
}

impl KeyColumns {
    fn of(kind: &NodeKeyKind) -> Result<Self, CacheError> {
        let mut columns = Self {
            class_id: None,
            is_polymorphic: None,
            property_name: None,
            grouping_values: None,
            grouped_instance_count: None,
            grouped_instance_keys: None,
        };
        let grouped = match kind {
            NodeKeyKind::Instances { .. } | NodeKeyKind::Other { .. } => None,
            NodeKeyKind::ClassGrouping {
                class_id,
                is_polymorphic,
                grouped,
            } => {
                columns.class_id = Some(to_sql_int(class_id.0));
                columns.is_polymorphic = Some(*is_polymorphic);
                Some(grouped)
            }
            NodeKeyKind::PropertyGrouping {
                class_id,
                property_name,
                grouping_values,
                grouped,
            } => {
                columns.class_id = Some(to_sql_int(class_id.0));
                columns.property_name = Some(property_name.clone());
                columns.grouping_values = Some(serde_json::to_string(grouping_values)?);
                Some(grouped)
            }
            NodeKeyKind::LabelGrouping { label, grouped } => {
                columns.grouping_values = Some(serde_json::to_string(label)?);
                Some(grouped)
            }
        };
        if let Some(grouped) = grouped {
            columns.grouped_instance_count = Some(to_sql_int(grouped.count));
            columns.grouped_instance_keys = match &grouped.keys {
                Some(keys) => Some(serde_json::to_string(keys)?),
                None => None,
            };
        }
        Ok(columns)
    }
}

impl CacheTxn<'_> {
    /// Store `node` as produced by data source `data_source_id` at local
    /// `index`, assigning `node.id` (and `node.parent_id`).
    ///
    /// A node whose key (type and hash path) already exists in the same
    /// level is not duplicated: the existing node gains one more data
    /// source association instead.
    pub fn cache_node(
        &self,
        node: &mut NavNode,
        data_source_id: DataSourceId,
        index: &NodeIndex,
        visibility: NodeVisibility,
    ) -> Result<NodeId, CacheError> {
        let placement: Option<(HierarchyLevelId, Option<NodeId>)> = self
            .conn()
            .prepare_cached(
                "SELECT ds.hierarchy_level_id, hl.parent_node_id
                   FROM data_sources ds JOIN hierarchy_levels hl ON hl.id = ds.hierarchy_level_id
                  WHERE ds.id = ?1",
            )?
            .query_row(params![data_source_id.to_string()], |row| {
                Ok((get_id(row, 0)?, get_opt_id(row, 1)?))
            })
            .optional()?;
        let (level_id, parent_id) = placement.ok_or_else(|| {
            CacheError::Inconsistent(format!("node cached for missing data source {data_source_id}"))
        })?;
        node.parent_id = parent_id;

        let id = match self.find_node_in_level(level_id, &node.key)? {
            Some(existing) => existing,
            None => {
                let id = self.insert_node(level_id, node)?;
                node.id = Some(id);
                self.hot().insert(Arc::new(node.clone()));
                id
            }
        };
        node.id = Some(id);

        self.conn()
            .prepare_cached(
                "INSERT INTO data_source_nodes (data_source_id, node_id, node_index, visibility)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(data_source_id, node_id) DO NOTHING",
            )?
            .execute(params![
                data_source_id.to_string(),
                id.to_string(),
                index.to_storage_string(),
                visibility.as_i64()
            ])?;
        Ok(id)
    }

    fn find_node_in_level(
        &self,
        level_id: HierarchyLevelId,
        key: &NodeKey,
    ) -> Result<Option<NodeId>, CacheError> {
        let path = key.hash_path.to_storage_string();
        let ids: Vec<NodeId> = match key.instance_keys() {
            [single] if key.node_type() == TYPE_INSTANCES => self
                .conn()
                .prepare_cached(
                    "SELECT n.id FROM node_instances ni
                       JOIN nodes n ON n.id = ni.node_id
                       JOIN node_keys k ON k.node_id = n.id
                      WHERE ni.class_id = ?1 AND ni.instance_id = ?2
                        AND n.hierarchy_level_id = ?3 AND k.type = ?4 AND k.path_from_root = ?5
                      LIMIT 2",
                )?
                .query_map(
                    params![
                        to_sql_int(single.class_id.0),
                        to_sql_int(single.instance_id.0),
                        level_id.to_string(),
                        key.node_type(),
                        path
                    ],
                    |row| get_id(row, 0),
                )?
                .collect::<Result<_, _>>()?,
            _ => self
                .conn()
                .prepare_cached(
                    "SELECT n.id FROM node_keys k JOIN nodes n ON n.id = k.node_id
                      WHERE k.path_from_root = ?1 AND k.type = ?2 AND n.hierarchy_level_id = ?3
                      LIMIT 2",
                )?
                .query_map(
                    params![path, key.node_type(), level_id.to_string()],
                    |row| get_id(row, 0),
                )?
                .collect::<Result<_, _>>()?,
        };
        if ids.len() > 1 {
            tracing::warn!(level = %level_id, path = %path, "duplicate nodes stored for one key");
            debug_assert!(ids.len() <= 1, "duplicate nodes stored for one key");
        }
        Ok(ids.into_iter().next())
    }

    fn insert_node(&self, level_id: HierarchyLevelId, node: &NavNode) -> Result<NodeId, CacheError> {
        let id = NodeId::generate();
        let payload = NodePayload {
            extended_data: node.extended_data.clone(),
            has_children: node.has_children,
        };
        self.conn()
            .prepare_cached(
                "INSERT INTO nodes (id, hierarchy_level_id, data, label, instance_keys_query)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                id.to_string(),
                level_id.to_string(),
                serde_json::to_string(&payload)?,
                node.label,
                node.instance_keys_query
            ])?;

        let columns = KeyColumns::of(&node.key.kind)?;
        self.conn()
            .prepare_cached(
                "INSERT INTO node_keys (node_id, type, specification_id, class_id, is_polymorphic,
                                        property_name, grouping_values, grouped_instance_count,
                                        grouped_instance_keys, path_from_root)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?
            .execute(params![
                id.to_string(),
                node.key.node_type(),
                node.key.specification_id,
                columns.class_id,
                columns.is_polymorphic,
                columns.property_name,
                columns.grouping_values,
                columns.grouped_instance_count,
                columns.grouped_instance_keys,
                node.key.hash_path.to_storage_string()
            ])?;

        let mut instances = self.conn().prepare_cached(
            "INSERT OR IGNORE INTO node_instances (node_id, class_id, instance_id) VALUES (?1, ?2, ?3)",
        )?;
        for key in node.key.instance_keys() {
            instances.execute(params![
                id.to_string(),
                to_sql_int(key.class_id.0),
                to_sql_int(key.instance_id.0)
            ])?;
        }

        let mut merged = self.conn().prepare_cached(
            "INSERT OR IGNORE INTO merged_nodes (merging_node_id, merged_node_id) VALUES (?1, ?2)",
        )?;
        for merged_id in &node.merged_node_ids {
            merged.execute(params![id.to_string(), merged_id.to_string()])?;
        }
        Ok(id)
    }

    /// Read a node by id, through the hot cache.
    pub fn get_node(&self, id: NodeId) -> Result<Option<Arc<NavNode>>, CacheError> {
        if let Some(node) = self.hot().get(&id) {
            return Ok(Some(node));
        }
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes n {NODE_JOINS} WHERE n.id = ?1");
        let row = self
            .conn()
            .prepare_cached(&sql)?
            .query_row(params![id.to_string()], NodeRow::read)
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let node = Arc::new(row.into_node()?);
        self.hot().insert(node.clone());
        Ok(Some(node))
    }

    /// Find the live, visible node of `ruleset_id` with this key whose data
    /// source variables are satisfied by `variables`.
    pub fn locate_node_by_key(
        &self,
        ruleset_id: &str,
        key: &NodeKey,
        variables: &RulesetVariables,
    ) -> Result<Option<Arc<NavNode>>, CacheError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes n {NODE_JOINS}
               JOIN rulesets r ON r.id = hl.ruleset_id
              WHERE k.path_from_root = ?1 AND k.type = ?2 AND r.identifier = ?3
                AND hl.removal_id IS NULL
                AND EXISTS (
                    SELECT 1 FROM data_source_nodes dsn
                      JOIN data_sources ds ON ds.id = dsn.data_source_id
                      JOIN variables v ON v.id = ds.variables_id
                     WHERE dsn.node_id = n.id AND dsn.visibility = ?4
                       AND variables_match(v.variables, ?5, 0))
              LIMIT 1"
        );
        let row = self
            .conn()
            .prepare_cached(&sql)?
            .query_row(
                params![
                    key.hash_path.to_storage_string(),
                    key.node_type(),
                    ruleset_id,
                    NodeVisibility::Visible.as_i64(),
                    variables.to_storage_string()
                ],
                NodeRow::read,
            )
            .optional()?;
        row.map(|row| row.into_node().map(Arc::new)).transpose()
    }

    /// Visibility of `node_id` in one data source, or its most visible
    /// association when `data_source_id` is `None`.
    pub fn get_node_visibility(
        &self,
        node_id: NodeId,
        data_source_id: Option<DataSourceId>,
    ) -> Result<Option<NodeVisibility>, CacheError> {
        let code: Option<i64> = match data_source_id {
            Some(ds) => self
                .conn()
                .prepare_cached(
                    "SELECT visibility FROM data_source_nodes WHERE node_id = ?1 AND data_source_id = ?2",
                )?
                .query_row(params![node_id.to_string(), ds.to_string()], |row| {
                    row.get(0)
                })
                .optional()?,
            None => self
                .conn()
                .prepare_cached("SELECT MIN(visibility) FROM data_source_nodes WHERE node_id = ?1")?
                .query_row(params![node_id.to_string()], |row| row.get(0))?,
        };
        Ok(code.and_then(NodeVisibility::from_i64))
    }

    /// Change a node's visibility in one data source, or in all of them.
    pub fn change_visibility(
        &self,
        node_id: NodeId,
        data_source_id: Option<DataSourceId>,
        visibility: NodeVisibility,
    ) -> Result<usize, CacheError> {
        let changed = self
            .conn()
            .prepare_cached(
                "UPDATE data_source_nodes SET visibility = ?3
                  WHERE node_id = ?1 AND (?2 IS NULL OR data_source_id = ?2)",
            )?
            .execute(params![
                node_id.to_string(),
                data_source_id.map(|id| id.to_string()),
                visibility.as_i64()
            ])?;
        if visibility == NodeVisibility::Virtual {
            self.hot().remove(&node_id);
        }
        Ok(changed)
    }

    pub fn make_virtual(
        &self,
        node_id: NodeId,
        data_source_id: Option<DataSourceId>,
    ) -> Result<usize, CacheError> {
        self.change_visibility(node_id, data_source_id, NodeVisibility::Virtual)
    }

    pub fn make_hidden(
        &self,
        node_id: NodeId,
        data_source_id: Option<DataSourceId>,
    ) -> Result<usize, CacheError> {
        self.change_visibility(node_id, data_source_id, NodeVisibility::Hidden)
    }

    pub fn make_visible(
        &self,
        node_id: NodeId,
        data_source_id: Option<DataSourceId>,
    ) -> Result<usize, CacheError> {
        self.change_visibility(node_id, data_source_id, NodeVisibility::Visible)
    }

    /// The node's ordering index within its level through `data_source_id`:
    /// the data source's index followed by the node's local index.
    pub fn get_node_index(
        &self,
        node_id: NodeId,
        data_source_id: DataSourceId,
    ) -> Result<Option<NodeIndex>, CacheError> {
        let stored: Option<String> = self
            .conn()
            .prepare_cached(
                "SELECT concat_index(ds.ordering_index, dsn.node_index)
                   FROM data_source_nodes dsn JOIN data_sources ds ON ds.id = dsn.data_source_id
                  WHERE dsn.node_id = ?1 AND dsn.data_source_id = ?2",
            )?
            .query_row(
                params![node_id.to_string(), data_source_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored
            .map(|text| NodeIndex::from_storage_string(&text))
            .transpose()?)
    }

    /// Nearest node at or above `node_id` that is not virtual.
    pub fn resolve_physical_node(
        &self,
        node_id: NodeId,
    ) -> Result<Option<Arc<NavNode>>, CacheError> {
        let mut current = node_id;
        loop {
            let Some(node) = self.get_node(current)? else {
                return Ok(None);
            };
            if self.get_node_visibility(current, None)? != Some(NodeVisibility::Virtual) {
                return Ok(Some(node));
            }
            match node.parent_id {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    /// The node's parent, skipping virtual ancestors. `None` when the node
    /// sits (possibly through virtual nodes) directly under the root.
    pub fn get_physical_parent(
        &self,
        node_id: NodeId,
    ) -> Result<Option<Arc<NavNode>>, CacheError> {
        let Some(node) = self.get_node(node_id)? else {
            return Ok(None);
        };
        match node.parent_id {
            Some(parent) => self.resolve_physical_node(parent),
            None => Ok(None),
        }
    }

    /// Data source associations of a node, as `(data source, local index,
    /// visibility)`.
    pub fn node_associations(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<(DataSourceId, NodeIndex, NodeVisibility)>, CacheError> {
        let rows: Vec<(DataSourceId, String, i64)> = self
            .conn()
            .prepare_cached(
                "SELECT data_source_id, node_index, visibility FROM data_source_nodes
                  WHERE node_id = ?1 ORDER BY node_index",
            )?
            .query_map(params![node_id.to_string()], |row| {
                Ok((get_id(row, 0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(ds, index, code)| {
                let visibility = NodeVisibility::from_i64(code).ok_or_else(|| {
                    CacheError::Inconsistent(format!("unknown visibility code {code}"))
                })?;
                Ok((ds, NodeIndex::from_storage_string(&index)?, visibility))
            })
            .collect()
    }
}
