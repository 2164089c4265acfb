//! Lock stamps on hierarchy levels.
//!
//! A level is locked while `now - lock_timestamp < timeout`. Holders keep
//! their stamp fresh; a holder that dies simply stops refreshing and the
//! lock lapses. Locks cover subtrees: a level counts as locked when it or
//! any ancestor level with the same removal id carries a fresh stamp.

use crate::error::CacheError;
use crate::sql::opt_text;
use crate::txn::CacheTxn;
use chrono::{DateTime, Utc};
use hiercache_kernel::{HierarchyLevelId, HierarchyLevelIdentifier};
use rusqlite::params;

impl CacheTxn<'_> {
    fn lock_timeout_ms(&self) -> i64 {
        self.config().lock_timeout_ms as i64
    }

    /// Whether the level or any of its ancestors holds a fresh lock.
    ///
    /// Works for levels that do not exist yet: the walk also starts at the
    /// level containing the parent node.
    pub fn is_hierarchy_level_locked(
        &self,
        identifier: &HierarchyLevelIdentifier,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let locked: bool = self
            .conn()
            .prepare_cached(
                "WITH RECURSIVE ancestors(level_id, parent_node_id, removal_id, lock_timestamp) AS (
                     SELECT * FROM (
                         SELECT hl.id, hl.parent_node_id, hl.removal_id, hl.lock_timestamp
                           FROM hierarchy_levels hl JOIN rulesets r ON r.id = hl.ruleset_id
                          WHERE hl.parent_node_id IS ?1 AND r.identifier = ?2 AND hl.removal_id IS ?3
                         UNION ALL
                         SELECT hl.id, hl.parent_node_id, hl.removal_id, hl.lock_timestamp
                           FROM nodes n JOIN hierarchy_levels hl ON hl.id = n.hierarchy_level_id
                          WHERE n.id = ?1 AND hl.removal_id IS ?3
                     )
                     UNION
                     SELECT parent.id, parent.parent_node_id, parent.removal_id, parent.lock_timestamp
                       FROM ancestors a
                       JOIN nodes n ON n.id = a.parent_node_id
                       JOIN hierarchy_levels parent ON parent.id = n.hierarchy_level_id
                      WHERE parent.removal_id IS a.removal_id
                 )
                 SELECT EXISTS(
                     SELECT 1 FROM ancestors
                      WHERE lock_timestamp IS NOT NULL AND ?4 - lock_timestamp < ?5)",
            )?
            .query_row(
                params![
                    opt_text(identifier.parent_node_id.as_ref()),
                    identifier.ruleset_id,
                    opt_text(identifier.removal_id.as_ref()),
                    now.timestamp_millis(),
                    self.lock_timeout_ms()
                ],
                |row| row.get(0),
            )?;
        Ok(locked)
    }

    /// Whether any level below `identifier` (same removal id) holds a
    /// fresh lock.
    pub fn is_any_child_hierarchy_level_locked(
        &self,
        identifier: &HierarchyLevelIdentifier,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let locked: bool = self
            .conn()
            .prepare_cached(
                "WITH RECURSIVE descendants(level_id, removal_id, lock_timestamp, depth) AS (
                     SELECT hl.id, hl.removal_id, hl.lock_timestamp, 0
                       FROM hierarchy_levels hl JOIN rulesets r ON r.id = hl.ruleset_id
                      WHERE hl.parent_node_id IS ?1 AND r.identifier = ?2 AND hl.removal_id IS ?3
                     UNION
                     SELECT child.id, child.removal_id, child.lock_timestamp, d.depth + 1
                       FROM descendants d
                       JOIN nodes n ON n.hierarchy_level_id = d.level_id
                       JOIN hierarchy_levels child ON child.parent_node_id = n.id
                      WHERE child.removal_id IS d.removal_id
                 )
                 SELECT EXISTS(
                     SELECT 1 FROM descendants
                      WHERE depth > 0 AND lock_timestamp IS NOT NULL AND ?4 - lock_timestamp < ?5)",
            )?
            .query_row(
                params![
                    opt_text(identifier.parent_node_id.as_ref()),
                    identifier.ruleset_id,
                    opt_text(identifier.removal_id.as_ref()),
                    now.timestamp_millis(),
                    self.lock_timeout_ms()
                ],
                |row| row.get(0),
            )?;
        Ok(locked)
    }

    /// Write `now` as the level's lock stamp and return it in epoch ms.
    pub fn stamp_hierarchy_level_lock(
        &self,
        level_id: HierarchyLevelId,
        now: DateTime<Utc>,
    ) -> Result<i64, CacheError> {
        let stamp = now.timestamp_millis();
        let updated = self
            .conn()
            .prepare_cached("UPDATE hierarchy_levels SET lock_timestamp = ?2 WHERE id = ?1")?
            .execute(params![level_id.to_string(), stamp])?;
        if updated == 0 {
            return Err(CacheError::LockFailed(format!(
                "hierarchy level {level_id} does not exist"
            )));
        }
        Ok(stamp)
    }

    /// Refresh an existing stamp. Returns `false` when the level row is
    /// gone or no longer carries the expected removal id.
    pub fn refresh_hierarchy_level_lock(
        &self,
        level_id: HierarchyLevelId,
        identifier: &HierarchyLevelIdentifier,
        now: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let updated = self
            .conn()
            .prepare_cached(
                "UPDATE hierarchy_levels SET lock_timestamp = ?3
                  WHERE id = ?1 AND removal_id IS ?2",
            )?
            .execute(params![
                level_id.to_string(),
                opt_text(identifier.removal_id.as_ref()),
                now.timestamp_millis()
            ])?;
        Ok(updated > 0)
    }

    pub fn remove_hierarchy_level_lock(&self, level_id: HierarchyLevelId) -> Result<(), CacheError> {
        self.conn()
            .prepare_cached("UPDATE hierarchy_levels SET lock_timestamp = NULL WHERE id = ?1")?
            .execute(params![level_id.to_string()])?;
        Ok(())
    }
}
