// tests/integration_test.rs

//! Integration tests for the CinchDB engine
//!
//! End-to-end scenarios across project init, schema changes, branch
//! fork/merge, lazy tenants, the apply fan-out, and the safe SQL
//! executor.

use cinchdb::{CinchDb, Column, ColumnType, Error};
use serde_json::{Map, Value};
use std::path::Path;
use tempfile::TempDir;

fn engine() -> (TempDir, CinchDb) {
    // RUST_LOG=cinchdb=debug surfaces engine tracing in test output
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let temp = TempDir::new().unwrap();
    let engine = CinchDb::init(temp.path()).unwrap();
    engine.init_database("app", None, false).unwrap();
    engine.tenants("app", "main").materialize("main").unwrap();
    (temp, engine)
}

fn tenant_tables(root: &Path, database: &str, branch: &str, tenant: &str) -> Vec<String> {
    let path = cinchdb::paths::tenant_db_path(root, database, branch, tenant);
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
        .unwrap();
    let names = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<String>>>()
        .unwrap();
    names
}

fn tenant_columns(root: &Path, database: &str, branch: &str, tenant: &str, table: &str) -> Vec<String> {
    let path = cinchdb::paths::tenant_db_path(root, database, branch, tenant);
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .unwrap();
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();
    names
}

fn row(pairs: &[(&str, &str)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), Value::String(v.to_string()));
    }
    map
}

#[test]
fn test_project_lifecycle() {
    let temp = TempDir::new().unwrap();

    let engine = CinchDb::init(temp.path()).unwrap();
    assert!(temp.path().join(".cinchdb/metadata.db").exists());

    // Seeded root database with main branch and main tenant
    let databases = engine.list_databases().unwrap();
    assert_eq!(databases.len(), 1);
    assert_eq!(databases[0].name, "main");

    let branches = engine.branches("main").list().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].name, "main");

    let tenants = engine.tenants("main", "main").list().unwrap();
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0].name, "main");
    assert!(!tenants[0].materialized);
}

#[test]
fn test_fork_and_diverge() {
    let (temp, engine) = engine();

    let mut email = Column::new("email", ColumnType::Text);
    email.unique = true;
    engine
        .tables("app", "main")
        .create("users", vec![Column::new("name", ColumnType::Text), email], None)
        .unwrap();

    engine.branches("app").create("main", "feat").unwrap();
    engine
        .tables("app", "feat")
        .create("posts", vec![Column::new("title", ColumnType::Text)], None)
        .unwrap();

    let comparator = engine.comparator("app");
    let (source_only, target_only) = comparator.divergent("feat", "main").unwrap();
    assert_eq!(source_only.len(), 1);
    assert_eq!(source_only[0].entity_name, "posts");
    assert_eq!(source_only[0].change_type, cinchdb::ChangeType::CreateTable);
    assert!(target_only.is_empty());
    assert!(comparator.can_fast_forward("feat", "main").unwrap());

    let outcome = comparator.merge("feat", "main", false).unwrap();
    assert_eq!(outcome.applied, 1);

    // main now has users and posts
    let tables = engine.tables("app", "main").list().unwrap();
    assert!(tables.contains(&"users".to_string()));
    assert!(tables.contains(&"posts".to_string()));
    let on_disk = tenant_tables(temp.path(), "app", "main", "main");
    assert!(on_disk.contains(&"posts".to_string()));
}

#[test]
fn test_conflicting_forks() {
    let (_temp, engine) = engine();

    let branches = engine.branches("app");
    branches.create("main", "f1").unwrap();
    branches.create("main", "f2").unwrap();

    engine
        .tables("app", "f1")
        .create("users", vec![Column::new("name", ColumnType::Text)], None)
        .unwrap();
    engine
        .tables("app", "f2")
        .create("users", vec![Column::new("handle", ColumnType::Text)], None)
        .unwrap();

    let comparator = engine.comparator("app");
    let conflicts = comparator.detect_conflicts("f1", "f2").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity, "table:users");

    assert!(matches!(
        comparator.merge("f1", "f2", false),
        Err(Error::MergeConflict { .. })
    ));
}

#[test]
fn test_lazy_tenant_read_vs_write() {
    let (temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("k", vec![Column::new("v", ColumnType::Text)], None)
        .unwrap();
    engine.tenants("app", "main").create("t", true).unwrap();

    let query = engine.query("app", "main", "t");

    // Read on a lazy tenant returns no rows and stays lazy
    let result = query.query("SELECT * FROM k", &[]).unwrap();
    assert!(result.rows.is_empty());
    assert!(!cinchdb::paths::tenant_db_path(temp.path(), "app", "main", "t").exists());

    // Insert materializes the tenant
    query.insert("k", row(&[("v", "hello")])).unwrap();
    assert!(cinchdb::paths::tenant_db_path(temp.path(), "app", "main", "t").exists());

    let result = query.query("SELECT * FROM k", &[]).unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["v"], Value::String("hello".into()));

    // A fresh tenant starts empty even after t was written
    engine.tenants("app", "main").create("t2", true).unwrap();
    let result = engine
        .query("app", "main", "t2")
        .query("SELECT * FROM k", &[])
        .unwrap();
    assert!(result.rows.is_empty());
}

#[test]
fn test_apply_fan_out() {
    let (temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("events", vec![Column::new("kind", ColumnType::Text)], None)
        .unwrap();
    engine.tenants("app", "main").create("t1", false).unwrap();

    engine
        .columns("app", "main")
        .add("events", Column::new("c", ColumnType::Integer))
        .unwrap();

    for tenant in ["main", "t1", "__empty__"] {
        let cols = tenant_columns(temp.path(), "app", "main", tenant, "events");
        assert!(cols.contains(&"c".to_string()), "tenant {tenant} missing column c");
    }

    // No maintenance row remains after the apply
    let meta = rusqlite::Connection::open(temp.path().join(".cinchdb/metadata.db")).unwrap();
    let locks: i64 = meta
        .query_row("SELECT COUNT(*) FROM branch_maintenance", [], |row| row.get(0))
        .unwrap();
    assert_eq!(locks, 0);
}

#[test]
fn test_archive_and_reuse_branch_name() {
    let (temp, engine) = engine();

    let branches = engine.branches("app");
    branches.create("main", "x").unwrap();
    branches.delete("x").unwrap();
    branches.create("main", "x").unwrap();

    // Engine lists only the live branch
    let listed = branches.list().unwrap();
    assert_eq!(listed.iter().filter(|b| b.name == "x").count(), 1);
    assert!(listed.iter().all(|b| b.archived_at.is_none()));

    // The archived row is still present in the index
    let meta = rusqlite::Connection::open(temp.path().join(".cinchdb/metadata.db")).unwrap();
    let archived: i64 = meta
        .query_row(
            "SELECT COUNT(*) FROM branches WHERE name = 'x' AND archived_at IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(archived, 1);
}

#[test]
fn test_sql_executor_safety() {
    let (_temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("users", vec![Column::new("name", ColumnType::Text)], None)
        .unwrap();
    let query = engine.query("app", "main", "main");

    assert!(matches!(
        query.query("DROP TABLE users", &[]),
        Err(Error::SqlValidation(_))
    ));

    assert!(matches!(
        query.query("SELECT * FROM users; DELETE FROM users", &[]),
        Err(Error::SqlValidation(_))
    ));

    // Allowed with the explicit multi-statement flag
    query
        .query_with_options("SELECT * FROM users; DELETE FROM users", &[], &[], true)
        .unwrap();

    assert!(matches!(
        query.query("CREATE TABLE x(id int); SELECT 1", &[]),
        Err(Error::SqlValidation(_))
    ));
}

#[test]
fn test_branch_create_then_drop_restores_state() {
    let (temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("users", vec![Column::new("name", ColumnType::Text)], None)
        .unwrap();

    let meta_path = temp.path().join(".cinchdb/metadata.db");
    let count_rows = |sql: &str| -> i64 {
        let conn = rusqlite::Connection::open(&meta_path).unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    };
    let tenants_before = count_rows("SELECT COUNT(*) FROM tenants");
    let links_before = count_rows("SELECT COUNT(*) FROM branch_changes");
    let branch_dir = cinchdb::paths::branch_path(temp.path(), "app", "tmp");

    engine.branches("app").create("main", "tmp").unwrap();
    assert!(branch_dir.exists());

    engine.branches("app").delete("tmp").unwrap();
    assert!(!branch_dir.exists());
    assert_eq!(count_rows("SELECT COUNT(*) FROM tenants"), tenants_before);
    assert_eq!(count_rows("SELECT COUNT(*) FROM branch_changes"), links_before);
}

#[test]
fn test_boolean_columns_round_trip() {
    let (_temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("flags", vec![Column::new("active", ColumnType::Boolean)], None)
        .unwrap();

    let query = engine.query("app", "main", "main");
    let mut values = Map::new();
    values.insert("active".to_string(), Value::Bool(true));
    query.insert("flags", values).unwrap();

    let result = query.query("SELECT active FROM flags", &[]).unwrap();
    assert_eq!(result.rows[0]["active"], Value::from(1));

    // The CHECK constraint rejects non-boolean integers
    let bad = query.query(
        "INSERT INTO flags (id, active) VALUES ('x', 7)",
        &[],
    );
    assert!(bad.is_err());

    // Boolean survives schema reflection
    let cols = engine.tables("app", "main").columns("flags").unwrap();
    assert_eq!(cols[0].col_type, ColumnType::Boolean);
}

#[test]
fn test_maintenance_mode_blocks_writes() {
    let (temp, engine) = engine();

    // Simulate another actor holding the lock
    {
        let meta = rusqlite::Connection::open(temp.path().join(".cinchdb/metadata.db")).unwrap();
        let branch_id: String = meta
            .query_row(
                "SELECT b.id FROM branches b JOIN databases d ON d.id = b.database_id
                 WHERE d.name = 'app' AND b.name = 'main'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        meta.execute(
            "INSERT INTO branch_maintenance (branch_id, reason, started_at)
             VALUES (?1, 'external apply', '2026-01-01T00:00:00Z')",
            [branch_id],
        )
        .unwrap();
    }

    let err = engine
        .tables("app", "main")
        .create("blocked", vec![], None)
        .unwrap_err();
    assert!(matches!(err, Error::MaintenanceInProgress { .. }));

    let err = engine.tenants("app", "main").create("t", true).unwrap_err();
    assert!(matches!(err, Error::MaintenanceInProgress { .. }));
}

#[test]
fn test_indexes_and_views_end_to_end() {
    let (temp, engine) = engine();

    engine
        .tables("app", "main")
        .create(
            "users",
            vec![
                Column::new("email", ColumnType::Text),
                Column::new("age", ColumnType::Integer),
            ],
            None,
        )
        .unwrap();

    let name = engine
        .indexes("app", "main")
        .create("users", &["email".to_string()], None, true)
        .unwrap();
    assert_eq!(name, "uniq_users_email");

    // Unknown column fails before any SQL runs
    assert!(matches!(
        engine
            .indexes("app", "main")
            .create("users", &["ghost".to_string()], None, false),
        Err(Error::NotFound(_))
    ));

    engine
        .views("app", "main")
        .create("adults", "SELECT * FROM users WHERE age >= 18")
        .unwrap();

    // The unique index is enforced in tenant files
    let query = engine.query("app", "main", "main");
    query.insert("users", row(&[("email", "a@x")])).unwrap();
    let dup = query.insert("users", row(&[("email", "a@x")]));
    assert!(dup.is_err());

    let views = engine.views("app", "main").list().unwrap();
    assert_eq!(views.len(), 1);

    let path = cinchdb::paths::tenant_db_path(temp.path(), "app", "main", "main");
    let conn = rusqlite::Connection::open(path).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='view' AND name='adults'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_tenant_rename_and_copy() {
    let (_temp, engine) = engine();

    engine
        .tables("app", "main")
        .create("notes", vec![Column::new("body", ColumnType::Text)], None)
        .unwrap();

    let tenants = engine.tenants("app", "main");
    tenants.create("acme", false).unwrap();

    engine
        .query("app", "main", "acme")
        .insert("notes", row(&[("body", "hi")]))
        .unwrap();

    tenants.rename("acme", "globex").unwrap();
    let result = engine
        .query("app", "main", "globex")
        .query("SELECT * FROM notes", &[])
        .unwrap();
    assert_eq!(result.rows.len(), 1);

    tenants.copy("globex", "initech").unwrap();
    let result = engine
        .query("app", "main", "initech")
        .query("SELECT * FROM notes", &[])
        .unwrap();
    assert_eq!(result.rows.len(), 1);

    let names: Vec<String> = tenants.list().unwrap().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"globex".to_string()));
    assert!(names.contains(&"initech".to_string()));
    assert!(!names.contains(&"acme".to_string()));
}

#[test]
fn test_lazy_database_materializes_with_history() {
    let (temp, engine) = engine();

    engine.init_database("analytics", None, true).unwrap();
    engine
        .tables("analytics", "main")
        .create("events", vec![Column::new("kind", ColumnType::Text)], None)
        .unwrap();

    // Still nothing on disk
    assert!(!cinchdb::paths::database_path(temp.path(), "analytics").exists());

    engine.materialize_database("analytics").unwrap();
    let tables = tenant_tables(temp.path(), "analytics", "main", "__empty__");
    assert!(tables.contains(&"events".to_string()));
}
