// src/branch.rs

//! Branch management: fork, archive-on-delete, and on-disk
//! materialization of a branch's directory tree.

use crate::changes::applier::sql_for;
use crate::changes::Change;
use crate::config::{EMPTY_TENANT, MAIN};
use crate::connection;
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::maintenance;
use crate::metadata::models::{BranchRecord, DatabaseRecord, TenantRecord};
use crate::naming::validate_name;
use crate::paths;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Look up a database by name or fail with `NotFound`
pub(crate) fn resolve_database(conn: &Connection, name: &str) -> Result<DatabaseRecord> {
    DatabaseRecord::get(conn, name)?
        .ok_or_else(|| Error::NotFound(format!("database '{name}'")))
}

/// Look up a live branch by name or fail with `NotFound`
pub(crate) fn resolve_branch(
    conn: &Connection,
    database: &DatabaseRecord,
    name: &str,
) -> Result<BranchRecord> {
    BranchRecord::get(conn, &database.id, name)?.ok_or_else(|| {
        Error::NotFound(format!("branch '{}' in database '{}'", name, database.name))
    })
}

/// Recursively copy a directory tree
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Make sure a branch has its directory tree and `__empty__` template
/// file on disk, replaying the branch's applied changes into a fresh
/// template when one has to be created.
pub(crate) fn ensure_branch_storage(
    ctx: &Arc<EngineCtx>,
    database: &str,
    branch: &BranchRecord,
) -> Result<()> {
    let tenants_dir = paths::tenants_path(&ctx.root, database, &branch.name);
    std::fs::create_dir_all(&tenants_dir)?;

    let empty_path = ctx
        .paths
        .tenant_db(&ctx.root, database, &branch.name, EMPTY_TENANT);

    if !empty_path.exists() {
        debug!(
            "Creating schema template for {}/{}",
            database, branch.name
        );
        connection::create_database_file(&empty_path, connection::EMPTY_PAGE_SIZE)?;

        let (applied, empty_tenant) = {
            let conn = ctx.meta.conn();
            let changes = Change::list_for_branch(&conn, &branch.id)?;
            let empty_tenant = TenantRecord::get(&conn, &branch.id, EMPTY_TENANT)?;
            (
                changes.into_iter().filter(|c| c.applied).collect::<Vec<_>>(),
                empty_tenant,
            )
        };

        if !applied.is_empty() {
            let tenant_id = empty_tenant
                .as_ref()
                .map(|t| t.id.as_str())
                .unwrap_or(EMPTY_TENANT);
            let encryption = ctx.encryption();
            let conn = connection::open_tenant(&empty_path, tenant_id, encryption.as_ref())?;
            for change in &applied {
                conn.execute_batch(&sql_for(change)?)
                    .map_err(|e| Error::SchemaError {
                        change_id: change.id.clone(),
                        tenant: EMPTY_TENANT.to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        let conn = ctx.meta.conn();
        if let Some(tenant) = &empty_tenant {
            TenantRecord::mark_materialized(&conn, &tenant.id)?;
        }
    }

    let conn = ctx.meta.conn();
    BranchRecord::mark_materialized(&conn, &branch.id)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BranchManager {
    ctx: Arc<EngineCtx>,
    database: String,
}

impl BranchManager {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
        }
    }

    /// Live branches of the database
    pub fn list(&self) -> Result<Vec<BranchRecord>> {
        let conn = self.ctx.meta.conn();
        let db = resolve_database(&conn, &self.database)?;
        BranchRecord::list(&conn, &db.id)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.ctx.meta.conn();
        let db = resolve_database(&conn, &self.database)?;
        Ok(BranchRecord::get(&conn, &db.id, name)?.is_some())
    }

    pub fn get(&self, name: &str) -> Result<BranchRecord> {
        let conn = self.ctx.meta.conn();
        let db = resolve_database(&conn, &self.database)?;
        resolve_branch(&conn, &db, name)
    }

    /// Fork `target` off `source`: the new branch inherits the
    /// source's tenants, full change history, and (when the source is
    /// materialized) a verbatim copy of its on-disk tree.
    pub fn create(&self, source: &str, target: &str) -> Result<BranchRecord> {
        validate_name(target, "branch")?;

        let (source_branch, new_branch) = {
            let mut conn = self.ctx.meta.conn();

            let db = resolve_database(&conn, &self.database)?;
            let source_branch = resolve_branch(&conn, &db, source)?;
            if BranchRecord::get(&conn, &db.id, target)?.is_some() {
                return Err(Error::AlreadyExists(format!("branch '{target}'")));
            }

            let mut new_branch = BranchRecord::new(&db.id, target, Some(source));
            new_branch.schema_version = source_branch.schema_version.clone();
            new_branch.metadata = Some(serde_json::json!({ "copied_from": source }));

            let tx = conn.transaction()?;
            new_branch.insert(&tx)?;

            let source_tenants = TenantRecord::list(&tx, &source_branch.id)?;
            let mut has_empty = false;
            for tenant in &source_tenants {
                if tenant.name == EMPTY_TENANT {
                    has_empty = true;
                }
                let mut copied = TenantRecord::new(&new_branch.id, &tenant.name, &tenant.shard);
                copied.materialized = tenant.materialized;
                copied.metadata = tenant.metadata.clone();
                copied.insert(&tx)?;
            }
            if !has_empty {
                let mut empty = TenantRecord::new(
                    &new_branch.id,
                    EMPTY_TENANT,
                    &paths::shard_for(EMPTY_TENANT),
                );
                empty.metadata = Some(serde_json::json!({ "system": true }));
                empty.insert(&tx)?;
            }

            Change::copy_links(&tx, &source_branch.id, &new_branch.id)?;
            tx.commit()?;

            (source_branch, new_branch)
        };

        if source_branch.materialized {
            let source_path = paths::branch_path(&self.ctx.root, &self.database, source);
            let target_path = paths::branch_path(&self.ctx.root, &self.database, target);
            if source_path.exists() {
                copy_dir_all(&source_path, &target_path)?;
            }
            let conn = self.ctx.meta.conn();
            BranchRecord::mark_materialized(&conn, &new_branch.id)?;
        }

        info!(
            "Created branch {}/{} from {}",
            self.database, target, source
        );
        Ok(new_branch)
    }

    /// Archive a branch: the row stays with `archived_at` set (its
    /// name becomes reusable), tenants are hard-deleted, and the
    /// on-disk tree is removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        if name == MAIN {
            return Err(Error::Protected("cannot delete the main branch".into()));
        }

        {
            let mut conn = self.ctx.meta.conn();
            let db = resolve_database(&conn, &self.database)?;
            let branch = resolve_branch(&conn, &db, name)?;
            maintenance::check(&conn, &branch.id, name)?;

            let tx = conn.transaction()?;
            BranchRecord::archive(&tx, &branch.id)?;
            TenantRecord::delete_for_branch(&tx, &branch.id)?;
            Change::clear_links(&tx, &branch.id)?;
            tx.commit()?;
        }

        let branch_dir = paths::branch_path(&self.ctx.root, &self.database, name);
        if branch_dir.exists() {
            std::fs::remove_dir_all(&branch_dir)?;
        }
        self.ctx
            .paths
            .invalidate(Some(&self.database), Some(name), None);

        info!("Deleted branch {}/{}", self.database, name);
        Ok(())
    }
}
