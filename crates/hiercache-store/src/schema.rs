//! Store schema.
//!
//! Ownership is expressed with foreign keys: deleting a hierarchy level
//! removes its data sources and nodes, deleting a node removes its key,
//! instance links, merge links and every level below it. A trigger
//! deletes a node once its last data source association is gone.
//! Connections must enable `foreign_keys` and `recursive_triggers`.

use crate::error::CacheError;
use rusqlite::{Connection, OptionalExtension, params};

pub const SCHEMA_VERSION_MAJOR: u32 = 1;
pub const SCHEMA_VERSION_MINOR: u32 = 0;

pub const PROPERTY_VERSION: &str = "version";
pub const PROPERTY_SOURCE_LAST_MODIFIED: &str = "source_last_modified";

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    name TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rulesets (
    id TEXT PRIMARY KEY NOT NULL,
    identifier TEXT NOT NULL,
    hash TEXT NOT NULL DEFAULT '',
    last_used_time INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_rulesets_identifier ON rulesets(identifier);

CREATE TABLE IF NOT EXISTS variables (
    id TEXT PRIMARY KEY NOT NULL,
    ruleset_id TEXT NOT NULL REFERENCES rulesets(id) ON DELETE CASCADE,
    variables TEXT NOT NULL,
    last_used_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_variables_ruleset ON variables(ruleset_id);

CREATE TABLE IF NOT EXISTS hierarchy_levels (
    id TEXT PRIMARY KEY NOT NULL,
    parent_node_id TEXT REFERENCES nodes(id) ON DELETE CASCADE,
    ruleset_id TEXT NOT NULL REFERENCES rulesets(id) ON DELETE CASCADE,
    removal_id TEXT,
    lock_timestamp INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_hierarchy_levels_identity
    ON hierarchy_levels(IFNULL(parent_node_id, ''), ruleset_id, IFNULL(removal_id, ''));
CREATE INDEX IF NOT EXISTS ix_hierarchy_levels_parent ON hierarchy_levels(parent_node_id);
CREATE INDEX IF NOT EXISTS ix_hierarchy_levels_removal ON hierarchy_levels(removal_id);

CREATE TABLE IF NOT EXISTS data_sources (
    id TEXT PRIMARY KEY NOT NULL,
    hierarchy_level_id TEXT NOT NULL REFERENCES hierarchy_levels(id) ON DELETE CASCADE,
    parent_id TEXT REFERENCES data_sources(id) ON DELETE CASCADE,
    ordering_index TEXT NOT NULL,
    variables_id TEXT NOT NULL REFERENCES variables(id) ON DELETE CASCADE,
    instance_filter TEXT NOT NULL DEFAULT '',
    filter TEXT NOT NULL DEFAULT '{}',
    specification_hash TEXT NOT NULL DEFAULT '',
    node_types TEXT NOT NULL DEFAULT '',
    has_nodes INTEGER,
    direct_nodes_count INTEGER,
    total_nodes_count INTEGER,
    is_initialized INTEGER NOT NULL DEFAULT 0,
    custom_json TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS ix_data_sources_level ON data_sources(hierarchy_level_id, ordering_index);
CREATE INDEX IF NOT EXISTS ix_data_sources_parent ON data_sources(parent_id);
CREATE INDEX IF NOT EXISTS ix_data_sources_variables ON data_sources(variables_id);

CREATE TABLE IF NOT EXISTS data_source_classes (
    data_source_id TEXT NOT NULL REFERENCES data_sources(id) ON DELETE CASCADE,
    class_id INTEGER NOT NULL,
    polymorphic INTEGER NOT NULL,
    PRIMARY KEY (data_source_id, class_id)
);
CREATE INDEX IF NOT EXISTS ix_data_source_classes_class ON data_source_classes(class_id);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY NOT NULL,
    hierarchy_level_id TEXT NOT NULL REFERENCES hierarchy_levels(id) ON DELETE CASCADE,
    data TEXT NOT NULL,
    label TEXT NOT NULL DEFAULT '',
    instance_keys_query TEXT
);
CREATE INDEX IF NOT EXISTS ix_nodes_level ON nodes(hierarchy_level_id);

CREATE TABLE IF NOT EXISTS node_keys (
    node_id TEXT PRIMARY KEY NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    specification_id TEXT NOT NULL,
    class_id INTEGER,
    is_polymorphic INTEGER,
    property_name TEXT,
    grouping_values TEXT,
    grouped_instance_count INTEGER,
    grouped_instance_keys TEXT,
    path_from_root TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_node_keys_path ON node_keys(path_from_root, type);

CREATE TABLE IF NOT EXISTS node_instances (
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    class_id INTEGER NOT NULL,
    instance_id INTEGER NOT NULL,
    PRIMARY KEY (node_id, class_id, instance_id)
);
CREATE INDEX IF NOT EXISTS ix_node_instances_instance ON node_instances(class_id, instance_id);

CREATE TABLE IF NOT EXISTS merged_nodes (
    merging_node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    merged_node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    PRIMARY KEY (merging_node_id, merged_node_id)
);
CREATE INDEX IF NOT EXISTS ix_merged_nodes_merged ON merged_nodes(merged_node_id);

CREATE TABLE IF NOT EXISTS data_source_nodes (
    data_source_id TEXT NOT NULL REFERENCES data_sources(id) ON DELETE CASCADE,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    node_index TEXT NOT NULL,
    visibility INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (data_source_id, node_id)
);
CREATE INDEX IF NOT EXISTS ix_data_source_nodes_node ON data_source_nodes(node_id);

CREATE TRIGGER IF NOT EXISTS tr_data_source_nodes_orphan
AFTER DELETE ON data_source_nodes
WHEN NOT EXISTS (SELECT 1 FROM data_source_nodes WHERE node_id = OLD.node_id)
BEGIN
    DELETE FROM nodes WHERE id = OLD.node_id;
END;
"#;

/// Tables that hold hierarchy content, in the order reports list them.
pub const CONTENT_TABLES: [&str; 8] = [
    "hierarchy_levels",
    "data_sources",
    "data_source_classes",
    "data_source_nodes",
    "nodes",
    "node_keys",
    "node_instances",
    "merged_nodes",
];

/// Connection settings every store connection runs with.
pub fn configure_connection(
    conn: &Connection,
    in_memory: bool,
    memory_cache_limit: u64,
) -> Result<(), CacheError> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "recursive_triggers", true)?;
    if in_memory {
        conn.pragma_update(None, "synchronous", 0)?;
    } else {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::trace!(journal_mode = %mode, "store journal mode");
        conn.pragma_update(None, "synchronous", 1)?;
        conn.pragma_update(None, "journal_size_limit", 0)?;
        conn.busy_handler(Some(retry_busy))?;
    }
    if memory_cache_limit > 0 {
        let kib = -((memory_cache_limit / 1024).max(1) as i64);
        conn.pragma_update(None, "cache_size", kib)?;
    }
    Ok(())
}

fn retry_busy(_attempt: i32) -> bool {
    std::thread::sleep(std::time::Duration::from_millis(1));
    true
}

/// Create every table and index that is missing. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(DDL)?;
    Ok(())
}

pub fn read_property(conn: &Connection, name: &str) -> Result<Option<String>, CacheError> {
    Ok(conn
        .query_row(
            "SELECT value FROM properties WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn write_property(conn: &Connection, name: &str, value: &str) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO properties (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

/// `(major, minor)` recorded in the store, if any.
pub fn read_version(conn: &Connection) -> Result<Option<(u32, u32)>, CacheError> {
    let Some(text) = read_property(conn, PROPERTY_VERSION)? else {
        return Ok(None);
    };
    let (major, minor) = text
        .split_once('.')
        .ok_or_else(|| CacheError::Schema(format!("malformed version `{text}`")))?;
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| CacheError::Schema(format!("malformed version `{text}`")))
    };
    Ok(Some((parse(major)?, parse(minor)?)))
}

pub fn write_version(conn: &Connection) -> Result<(), CacheError> {
    write_property(
        conn,
        PROPERTY_VERSION,
        &format!("{SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}"),
    )
}

/// Whether the properties table exists yet.
pub fn has_schema(conn: &Connection) -> Result<bool, CacheError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'properties'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<u64, CacheError> {
    if !CONTENT_TABLES.contains(&table) && table != "rulesets" && table != "variables" {
        return Err(CacheError::Schema(format!("unknown table `{table}`")));
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        configure_connection(&conn, true, 0).expect("configure connection");
        create_tables(&conn).expect("create tables");
        conn
    }

    #[test]
    fn ddl_is_idempotent() {
        let conn = memory_conn();
        create_tables(&conn).expect("second create is a no-op");
        assert!(has_schema(&conn).expect("schema probe"));
    }

    #[test]
    fn version_round_trips() {
        let conn = memory_conn();
        assert_eq!(read_version(&conn).expect("read"), None);
        write_version(&conn).expect("write");
        assert_eq!(
            read_version(&conn).expect("read"),
            Some((SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR))
        );
    }

    #[test]
    fn malformed_version_is_a_schema_error() {
        let conn = memory_conn();
        write_property(&conn, PROPERTY_VERSION, "seven").expect("write");
        assert!(matches!(read_version(&conn), Err(CacheError::Schema(_))));
    }

    #[test]
    fn live_level_identity_is_unique_despite_nulls() {
        let conn = memory_conn();
        conn.execute(
            "INSERT INTO rulesets (id, identifier, last_used_time) VALUES ('r', 'R1', 0)",
            [],
        )
        .expect("insert ruleset");
        conn.execute(
            "INSERT INTO hierarchy_levels (id, ruleset_id) VALUES ('a', 'r')",
            [],
        )
        .expect("first root level");
        let dup = conn.execute(
            "INSERT INTO hierarchy_levels (id, ruleset_id) VALUES ('b', 'r')",
            [],
        );
        assert!(dup.is_err(), "a second live root level must be rejected");
        conn.execute(
            "INSERT INTO hierarchy_levels (id, ruleset_id, removal_id) VALUES ('c', 'r', 'x')",
            [],
        )
        .expect("tombstoned copy is allowed");
    }

    #[test]
    fn count_rows_refuses_unknown_tables() {
        let conn = memory_conn();
        assert!(count_rows(&conn, "sqlite_master").is_err());
        assert_eq!(count_rows(&conn, "nodes").expect("count"), 0);
    }
}
