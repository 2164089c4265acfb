//! Size control and planner upkeep.

use crate::error::CacheError;
use rusqlite::{Connection, OptionalExtension};

/// Bytes of the store file that hold live pages.
pub fn used_bytes(conn: &Connection) -> Result<u64, CacheError> {
    let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok(((page_count - freelist).max(0) * page_size) as u64)
}

/// Evict least recently used rulesets until the store fits in `limit`
/// bytes. The most recently used ruleset is never evicted. Returns the
/// number of rulesets removed; `limit == 0` disables eviction.
pub fn limit_cache_size(conn: &Connection, limit: u64) -> Result<usize, CacheError> {
    if limit == 0 {
        return Ok(0);
    }
    let mut evicted = 0;
    loop {
        let used = used_bytes(conn)?;
        if used <= limit {
            break;
        }
        let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM rulesets", [], |row| row.get(0))?;
        if remaining <= 1 {
            tracing::debug!(used, limit, "cache over budget with a single ruleset left");
            break;
        }
        let oldest: Option<(String, String)> = conn
            .query_row(
                "SELECT id, identifier FROM rulesets ORDER BY last_used_time ASC, identifier ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, identifier)) = oldest else {
            break;
        };
        conn.execute("DELETE FROM rulesets WHERE id = ?1", [&id])?;
        tracing::info!(ruleset = %identifier, used, limit, "evicted ruleset from hierarchy cache");
        evicted += 1;
    }
    Ok(evicted)
}

/// Refresh planner statistics after a large write.
pub fn optimize(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch("PRAGMA analysis_limit=500; PRAGMA optimize;")?;
    Ok(())
}
