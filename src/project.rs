// src/project.rs

//! Project and database initialization.
//!
//! A project is a directory holding the hidden state folder with the
//! metadata index and the tenant file tree. Databases can be created
//! lazy (metadata only) or eager (directory tree plus the `__empty__`
//! template on disk).

use crate::branch::ensure_branch_storage;
use crate::config::{EMPTY_TENANT, MAIN};
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::metadata::models::{BranchRecord, DatabaseRecord, TenantRecord};
use crate::metadata::pool::{self, MetadataHandle};
use crate::naming::validate_name;
use crate::paths;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Create the hidden state directory and metadata index for a
/// project, seeding the root `main` database with a `main` branch and
/// a lazy `main` tenant. Idempotent.
pub fn init_state(root: &Path) -> Result<MetadataHandle> {
    std::fs::create_dir_all(paths::state_dir(root))?;
    let meta = pool::metadata_handle(root)?;

    {
        let mut conn = meta.conn();
        if DatabaseRecord::get(&conn, MAIN)?.is_none() {
            let tx = conn.transaction()?;
            seed_database_rows(&tx, MAIN, None)?;
            tx.commit()?;
            info!("Initialized project at {}", root.display());
        }
    }

    Ok(meta)
}

/// Insert the rows for a fresh database: the database itself, its
/// `main` branch, and the `main` + `__empty__` tenants (all lazy).
fn seed_database_rows(
    conn: &rusqlite::Connection,
    name: &str,
    description: Option<&str>,
) -> Result<DatabaseRecord> {
    let database = DatabaseRecord::new(name, description);
    database.insert(conn)?;

    let branch = BranchRecord::new(&database.id, MAIN, None);
    branch.insert(conn)?;

    let main_tenant = TenantRecord::new(&branch.id, MAIN, &paths::shard_for(MAIN));
    main_tenant.insert(conn)?;

    let mut empty = TenantRecord::new(&branch.id, EMPTY_TENANT, &paths::shard_for(EMPTY_TENANT));
    empty.metadata = Some(serde_json::json!({ "system": true }));
    empty.insert(conn)?;

    Ok(database)
}

/// Create a database. Eager creation also materializes the branch
/// directory tree and the `__empty__` template file.
pub(crate) fn init_database(
    ctx: &Arc<EngineCtx>,
    name: &str,
    description: Option<&str>,
    lazy: bool,
) -> Result<DatabaseRecord> {
    validate_name(name, "database")?;

    {
        let mut conn = ctx.meta.conn();
        if DatabaseRecord::get(&conn, name)?.is_some() {
            return Err(Error::AlreadyExists(format!("database '{name}'")));
        }
        let tx = conn.transaction()?;
        seed_database_rows(&tx, name, description)?;
        tx.commit()?;
    }

    if !lazy {
        materialize_database(ctx, name)?;
    }

    let conn = ctx.meta.conn();
    DatabaseRecord::get(&conn, name)?
        .ok_or_else(|| Error::NotFound(format!("database '{name}'")))
}

/// Materialize a lazy database in place: directory tree, `__empty__`
/// template per branch, flags. Idempotent.
pub(crate) fn materialize_database(ctx: &Arc<EngineCtx>, name: &str) -> Result<()> {
    let (database, branches) = {
        let conn = ctx.meta.conn();
        let database = DatabaseRecord::get(&conn, name)?
            .ok_or_else(|| Error::NotFound(format!("database '{name}'")))?;
        let branches = BranchRecord::list(&conn, &database.id)?;
        (database, branches)
    };

    for branch in &branches {
        ensure_branch_storage(ctx, name, branch)?;
    }

    let conn = ctx.meta.conn();
    DatabaseRecord::mark_materialized(&conn, &database.id)?;
    Ok(())
}

/// Hard-delete a database: one cascading metadata transaction, then
/// the directory tree.
pub(crate) fn delete_database(ctx: &Arc<EngineCtx>, name: &str) -> Result<()> {
    if name == MAIN {
        return Err(Error::Protected("cannot delete the main database".into()));
    }

    {
        let mut conn = ctx.meta.conn();
        let database = DatabaseRecord::get(&conn, name)?
            .ok_or_else(|| Error::NotFound(format!("database '{name}'")))?;
        let tx = conn.transaction()?;
        DatabaseRecord::delete(&tx, &database.id)?;
        tx.commit()?;
    }

    let dir = paths::database_path(&ctx.root, name);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    ctx.paths.invalidate(Some(name), None, None);

    info!("Deleted database {name}");
    Ok(())
}
