// src/metadata/schema.rs

//! Schema definitions and migrations for the metadata index.
//!
//! The index is a single SQLite file enumerating every database,
//! branch, tenant, and schema change in the project, so listings and
//! existence checks never have to touch tenant files.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the index up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current metadata schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying metadata migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => panic!("Unknown metadata migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates all core tables:
/// - databases: named namespaces within the project
/// - branches: lines of schema evolution, archived on delete
/// - tenants: isolated SQLite files sharing a branch's schema
/// - changes: global record of every schema mutation
/// - branch_changes: ordered per-branch change history (link table)
/// - branch_maintenance: per-branch write lock held during apply/merge
/// - encryption_keys: opaque wrapped keys for the optional provider
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating metadata schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE databases (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            metadata TEXT,
            materialized INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE branches (
            id TEXT PRIMARY KEY,
            database_id TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_branch TEXT,
            schema_version TEXT,
            materialized INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            archived_at TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (database_id) REFERENCES databases(id) ON DELETE CASCADE
        );

        -- An archived name may be reused, so uniqueness only covers live rows
        CREATE UNIQUE INDEX idx_branches_active_name
            ON branches(database_id, name) WHERE archived_at IS NULL;
        CREATE INDEX idx_branches_database ON branches(database_id);

        CREATE TABLE tenants (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            name TEXT NOT NULL,
            shard TEXT NOT NULL,
            materialized INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(branch_id, name),
            FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_tenants_branch ON tenants(branch_id);

        CREATE TABLE changes (
            id TEXT PRIMARY KEY,
            database_id TEXT NOT NULL,
            origin_branch_id TEXT NOT NULL,
            type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            details TEXT,
            sql TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (database_id) REFERENCES databases(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_changes_database ON changes(database_id);

        CREATE TABLE branch_changes (
            branch_id TEXT NOT NULL,
            change_id TEXT NOT NULL,
            applied INTEGER NOT NULL DEFAULT 0,
            applied_order INTEGER NOT NULL,
            copied_from_branch_id TEXT,
            PRIMARY KEY (branch_id, change_id),
            FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE CASCADE,
            FOREIGN KEY (change_id) REFERENCES changes(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_branch_changes_order ON branch_changes(branch_id, applied_order);

        CREATE TABLE branch_maintenance (
            branch_id TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            started_at TEXT NOT NULL,
            FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE CASCADE
        );

        CREATE TABLE encryption_keys (
            tenant_id TEXT PRIMARY KEY,
            wrapped_key BLOB NOT NULL,
            cipher TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE CASCADE
        );
        ",
    )?;

    debug!("Metadata schema version 1 created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "databases",
            "branches",
            "tenants",
            "changes",
            "branch_changes",
            "branch_maintenance",
            "encryption_keys",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_archived_branch_name_reusable() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO databases (id, name) VALUES ('db1', 'app')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO branches (id, database_id, name) VALUES ('b1', 'db1', 'feat')",
            [],
        )
        .unwrap();

        // Duplicate live name fails
        let dup = conn.execute(
            "INSERT INTO branches (id, database_id, name) VALUES ('b2', 'db1', 'feat')",
            [],
        );
        assert!(dup.is_err());

        // Archive the original, then the name is free again
        conn.execute(
            "UPDATE branches SET archived_at = '2026-01-01T00:00:00Z' WHERE id = 'b1'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO branches (id, database_id, name) VALUES ('b2', 'db1', 'feat')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_cascade_from_database() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO databases (id, name) VALUES ('db1', 'app')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO branches (id, database_id, name) VALUES ('b1', 'db1', 'main')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tenants (id, branch_id, name, shard) VALUES ('t1', 'b1', 'main', 'aa')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO changes (id, database_id, origin_branch_id, type, entity_type, entity_name, created_at)
             VALUES ('c1', 'db1', 'b1', 'CREATE_TABLE', 'table', 'users', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO branch_changes (branch_id, change_id, applied, applied_order)
             VALUES ('b1', 'c1', 0, 1)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM databases WHERE id = 'db1'", [])
            .unwrap();

        let branches: i64 = conn
            .query_row("SELECT COUNT(*) FROM branches", [], |row| row.get(0))
            .unwrap();
        assert_eq!(branches, 0);
        let tenants: i64 = conn
            .query_row("SELECT COUNT(*) FROM tenants", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tenants, 0);
        let links: i64 = conn
            .query_row("SELECT COUNT(*) FROM branch_changes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(links, 0);
    }
}
