//! Lazy, paged reads of cached nodes.
//!
//! Children of virtual nodes are spliced in where the virtual node sits;
//! hidden nodes and the virtual nodes themselves are never returned.
//! Positions are the data source index followed by the node's local index,
//! extended through every virtual node on the way.

use crate::cache::NodesCache;
use crate::error::CacheError;
use crate::nodes::{NODE_COLUMNS, NODE_JOINS, NodeRow};
use crate::txn::CacheTxn;
use hiercache_kernel::{
    DataSourceId, HierarchyLevelId, NavNode, NodeVisibility, RulesetVariables,
};
use once_cell::unsync::OnceCell;
use rusqlite::params;
use std::collections::VecDeque;
use std::sync::Arc;

/// The three queries a paged sequence is built from.
pub trait NodePageQuery {
    fn has_virtual_nodes(&self, txn: &CacheTxn<'_>) -> Result<bool, CacheError>;

    fn count(&self, txn: &CacheTxn<'_>) -> Result<u64, CacheError>;

    /// Nodes `offset..offset + limit` in position order; `None` reads to
    /// the end.
    fn page(
        &self,
        txn: &CacheTxn<'_>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<NavNode>, CacheError>;
}

/// `placed(node_id, visibility, position)`: every association reachable
/// from the seed data sources, descending through virtual nodes into
/// their child levels of the same removal generation.
fn placed_cte(seed: &str) -> String {
    format!(
        "WITH RECURSIVE placed(node_id, visibility, position) AS (
             SELECT dsn.node_id, dsn.visibility, concat_index(ds.ordering_index, dsn.node_index)
               FROM data_source_nodes dsn
               JOIN data_sources ds ON ds.id = dsn.data_source_id
               JOIN variables v ON v.id = ds.variables_id
              WHERE {seed} AND variables_match(v.variables, ?2, 0)
             UNION ALL
             SELECT dsn.node_id, dsn.visibility,
                    concat_index(concat_index(p.position, ds.ordering_index), dsn.node_index)
               FROM placed p
               JOIN nodes vn ON vn.id = p.node_id
               JOIN hierarchy_levels vl ON vl.id = vn.hierarchy_level_id
               JOIN hierarchy_levels child ON child.parent_node_id = p.node_id
               JOIN data_sources ds ON ds.hierarchy_level_id = child.id
               JOIN variables v ON v.id = ds.variables_id
               JOIN data_source_nodes dsn ON dsn.data_source_id = ds.id
              WHERE p.visibility = {virtual_code}
                AND child.removal_id IS vl.removal_id
                AND variables_match(v.variables, ?2, 0)
         )",
        virtual_code = NodeVisibility::Virtual.as_i64()
    )
}

fn count_placed(
    txn: &CacheTxn<'_>,
    seed: &str,
    key: String,
    variables: &RulesetVariables,
) -> Result<u64, CacheError> {
    let sql = format!(
        "{} SELECT COUNT(DISTINCT node_id) FROM placed WHERE visibility = {}",
        placed_cte(seed),
        NodeVisibility::Visible.as_i64()
    );
    let count: i64 = txn
        .conn()
        .prepare_cached(&sql)?
        .query_row(params![key, variables.to_storage_string()], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

fn page_placed(
    txn: &CacheTxn<'_>,
    seed: &str,
    key: String,
    variables: &RulesetVariables,
    offset: u64,
    limit: Option<u64>,
) -> Result<Vec<NavNode>, CacheError> {
    let sql = format!(
        "{cte}
         SELECT {NODE_COLUMNS}
           FROM (SELECT node_id, MIN(position) AS position FROM placed
                  WHERE visibility = {visible} GROUP BY node_id) p
           JOIN nodes n ON n.id = p.node_id
           {NODE_JOINS}
          ORDER BY p.position, n.id
          LIMIT ?3 OFFSET ?4",
        cte = placed_cte(seed),
        visible = NodeVisibility::Visible.as_i64()
    );
    let limit = limit.map(|limit| limit.min(i64::MAX as u64) as i64).unwrap_or(-1);
    let rows: Vec<NodeRow> = txn
        .conn()
        .prepare_cached(&sql)?
        .query_map(
            params![key, variables.to_storage_string(), limit, offset as i64],
            NodeRow::read,
        )?
        .collect::<Result<_, _>>()?;
    rows.into_iter().map(NodeRow::into_node).collect()
}

/// All visible nodes of one hierarchy level for a variables set.
#[derive(Debug, Clone)]
pub struct HierarchyLevelNodes {
    pub level_id: HierarchyLevelId,
    pub variables: RulesetVariables,
}

const LEVEL_SEED: &str = "ds.hierarchy_level_id = ?1";

impl NodePageQuery for HierarchyLevelNodes {
    fn has_virtual_nodes(&self, txn: &CacheTxn<'_>) -> Result<bool, CacheError> {
        Ok(txn
            .conn()
            .prepare_cached(
                "SELECT EXISTS(
                     SELECT 1 FROM data_source_nodes dsn
                       JOIN data_sources ds ON ds.id = dsn.data_source_id
                       JOIN variables v ON v.id = ds.variables_id
                      WHERE ds.hierarchy_level_id = ?1 AND dsn.visibility = ?3
                        AND variables_match(v.variables, ?2, 0))",
            )?
            .query_row(
                params![
                    self.level_id.to_string(),
                    self.variables.to_storage_string(),
                    NodeVisibility::Virtual.as_i64()
                ],
                |row| row.get(0),
            )?)
    }

    fn count(&self, txn: &CacheTxn<'_>) -> Result<u64, CacheError> {
        count_placed(txn, LEVEL_SEED, self.level_id.to_string(), &self.variables)
    }

    fn page(
        &self,
        txn: &CacheTxn<'_>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<NavNode>, CacheError> {
        page_placed(
            txn,
            LEVEL_SEED,
            self.level_id.to_string(),
            &self.variables,
            offset,
            limit,
        )
    }
}

/// Visible nodes of a single (possibly partial) data source.
#[derive(Debug, Clone)]
pub struct DataSourceNodes {
    pub data_source_id: DataSourceId,
    pub variables: RulesetVariables,
}

const DATA_SOURCE_SEED: &str = "ds.id = ?1";

impl NodePageQuery for DataSourceNodes {
    fn has_virtual_nodes(&self, txn: &CacheTxn<'_>) -> Result<bool, CacheError> {
        Ok(txn
            .conn()
            .prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM data_source_nodes WHERE data_source_id = ?1 AND visibility = ?2)",
            )?
            .query_row(
                params![
                    self.data_source_id.to_string(),
                    NodeVisibility::Virtual.as_i64()
                ],
                |row| row.get(0),
            )?)
    }

    fn count(&self, txn: &CacheTxn<'_>) -> Result<u64, CacheError> {
        count_placed(
            txn,
            DATA_SOURCE_SEED,
            self.data_source_id.to_string(),
            &self.variables,
        )
    }

    fn page(
        &self,
        txn: &CacheTxn<'_>,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<NavNode>, CacheError> {
        page_placed(
            txn,
            DATA_SOURCE_SEED,
            self.data_source_id.to_string(),
            &self.variables,
            offset,
            limit,
        )
    }
}

/// A finite sequence of cached nodes, read one page at a time.
///
/// Probes are run once per sequence. When the result has no virtual nodes
/// and fits in one page it is read with a single unpaged query.
pub struct PagedNodes<Q> {
    cache: Arc<NodesCache>,
    query: Q,
    page_size: u64,
    has_virtual: OnceCell<bool>,
    total: OnceCell<u64>,
    offset: u64,
    buffer: VecDeque<Arc<NavNode>>,
    done: bool,
}

impl PagedNodes<HierarchyLevelNodes> {
    pub fn level(
        cache: Arc<NodesCache>,
        level_id: HierarchyLevelId,
        variables: RulesetVariables,
    ) -> Self {
        Self::new(
            cache,
            HierarchyLevelNodes {
                level_id,
                variables,
            },
        )
    }
}

impl PagedNodes<DataSourceNodes> {
    pub fn data_source(
        cache: Arc<NodesCache>,
        data_source_id: DataSourceId,
        variables: RulesetVariables,
    ) -> Self {
        Self::new(
            cache,
            DataSourceNodes {
                data_source_id,
                variables,
            },
        )
    }
}

impl<Q: NodePageQuery> PagedNodes<Q> {
    pub fn new(cache: Arc<NodesCache>, query: Q) -> Self {
        let page_size = cache.config().page_size.max(1) as u64;
        Self {
            cache,
            query,
            page_size,
            has_virtual: OnceCell::new(),
            total: OnceCell::new(),
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1) as u64;
        self
    }

    pub fn has_virtual_nodes(&self) -> Result<bool, CacheError> {
        self.has_virtual
            .get_or_try_init(|| self.cache.read(|txn| self.query.has_virtual_nodes(txn)))
            .copied()
    }

    pub fn total_count(&self) -> Result<u64, CacheError> {
        self.total
            .get_or_try_init(|| self.cache.read(|txn| self.query.count(txn)))
            .copied()
    }

    /// The next page, or `None` once every node was returned.
    pub fn next_page(&mut self) -> Result<Option<Vec<Arc<NavNode>>>, CacheError> {
        if self.done {
            return Ok(None);
        }
        let total = self.total_count()?;
        if self.offset >= total {
            self.done = true;
            return Ok(None);
        }
        let unpaged = self.offset == 0 && total <= self.page_size && !self.has_virtual_nodes()?;
        let limit = if unpaged { None } else { Some(self.page_size) };
        let offset = self.offset;
        let nodes = self
            .cache
            .read(|txn| self.query.page(txn, offset, limit))?;
        tracing::trace!(offset, loaded = nodes.len(), total, "loaded node page");
        if nodes.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.offset += nodes.len() as u64;
        if unpaged {
            self.done = true;
        }
        Ok(Some(nodes.into_iter().map(Arc::new).collect()))
    }
}

impl<Q: NodePageQuery> Iterator for PagedNodes<Q> {
    type Item = Result<Arc<NavNode>, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(node) = self.buffer.pop_front() {
            return Some(Ok(node));
        }
        match self.next_page() {
            Ok(Some(page)) => {
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
