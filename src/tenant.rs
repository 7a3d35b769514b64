// src/tenant.rs

//! Tenant lifecycle within a branch.
//!
//! A lazy tenant exists only in the metadata index; reads route to
//! the branch's `__empty__` template and the first write materializes
//! the tenant by copying the template byte for byte. Freshly created
//! files use 512-byte pages so empty tenants stay tiny;
//! `optimize_storage` upgrades the page size as data grows.

use crate::branch::{ensure_branch_storage, resolve_branch, resolve_database};
use crate::config::{EMPTY_TENANT, MAIN};
use crate::connection;
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::maintenance::{self, MaintenanceLock};
use crate::metadata::models::{BranchRecord, TenantRecord};
use crate::naming::validate_name;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// On-disk footprint of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub bytes: u64,
    pub page_size: u32,
}

/// Page size a tenant file should use for its current on-disk size.
/// SQLite can only change page size via a rebuild, so upgrades happen
/// in `optimize_storage` rather than continuously.
pub fn optimal_page_size(bytes: u64) -> u32 {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    match bytes {
        0..=102_400 => 512,           // <= 100 KiB
        b if b <= 256 * KIB => 1024,
        b if b <= 10 * MIB => 4096,
        b if b <= 100 * MIB => 8192,
        _ => 16384,
    }
}

#[derive(Debug, Clone)]
pub struct TenantManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
}

impl TenantManager {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str, branch: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
            branch: branch.to_string(),
        }
    }

    fn branch_record(&self) -> Result<BranchRecord> {
        let conn = self.ctx.meta.conn();
        let db = resolve_database(&conn, &self.database)?;
        resolve_branch(&conn, &db, &self.branch)
    }

    fn tenant_record(&self, branch_id: &str, name: &str) -> Result<TenantRecord> {
        let conn = self.ctx.meta.conn();
        TenantRecord::get(&conn, branch_id, name)?.ok_or_else(|| {
            Error::NotFound(format!(
                "tenant '{name}' on branch '{}/{}'",
                self.database, self.branch
            ))
        })
    }

    fn tenant_path(&self, name: &str) -> PathBuf {
        self.ctx
            .paths
            .tenant_db(&self.ctx.root, &self.database, &self.branch, name)
    }

    /// User-facing tenants of the branch; `__empty__` is hidden.
    pub fn list(&self) -> Result<Vec<TenantRecord>> {
        let branch = self.branch_record()?;
        let conn = self.ctx.meta.conn();
        let tenants = TenantRecord::list(&conn, &branch.id)?;
        Ok(tenants
            .into_iter()
            .filter(|t| t.name != EMPTY_TENANT)
            .collect())
    }

    /// Create a tenant. Lazy tenants get a metadata row only; eager
    /// tenants are materialized from the branch template immediately.
    pub fn create(&self, name: &str, lazy: bool) -> Result<TenantRecord> {
        validate_name(name, "tenant")?;
        let branch = self.branch_record()?;

        {
            let conn = self.ctx.meta.conn();
            maintenance::check(&conn, &branch.id, &self.branch)?;
            if TenantRecord::get(&conn, &branch.id, name)?.is_some() {
                return Err(Error::AlreadyExists(format!("tenant '{name}'")));
            }
            let tenant = TenantRecord::new(&branch.id, name, &self.ctx.paths.shard(name));
            tenant.insert(&conn)?;
        }

        if !lazy {
            self.materialize(name)?;
        }

        debug!(
            "Created {} tenant {} on {}/{}",
            if lazy { "lazy" } else { "eager" },
            name,
            self.database,
            self.branch
        );
        self.tenant_record(&branch.id, name)
    }

    /// Delete a tenant's row and files. `main` and `__empty__` are
    /// protected.
    pub fn delete(&self, name: &str) -> Result<()> {
        if name == MAIN || name == EMPTY_TENANT {
            return Err(Error::Protected(format!("cannot delete the {name} tenant")));
        }
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;

        {
            let conn = self.ctx.meta.conn();
            maintenance::check(&conn, &branch.id, &self.branch)?;
            TenantRecord::delete(&conn, &tenant.id)?;
        }

        let path = self.tenant_path(name);
        if path.exists() {
            connection::remove_database_files(&path)?;
        }
        self.ctx
            .paths
            .invalidate(Some(&self.database), Some(&self.branch), Some(name));

        info!("Deleted tenant {} on {}/{}", name, self.database, self.branch);
        Ok(())
    }

    /// Rename a tenant, moving its files into the new shard bucket
    /// and rotating encryption keys when a provider is registered.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if old == MAIN || old == EMPTY_TENANT {
            return Err(Error::Protected(format!("cannot rename the {old} tenant")));
        }
        validate_name(new, "tenant")?;
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, old)?;

        let new_shard = self.ctx.paths.shard(new);
        {
            let conn = self.ctx.meta.conn();
            maintenance::check(&conn, &branch.id, &self.branch)?;
            if TenantRecord::get(&conn, &branch.id, new)?.is_some() {
                return Err(Error::AlreadyExists(format!("tenant '{new}'")));
            }
            TenantRecord::rename(&conn, &tenant.id, new, &new_shard)?;
        }

        let old_path = self.tenant_path(old);
        if old_path.exists() {
            let new_path = self.tenant_path(new);
            connection::rename_database_files(&old_path, &new_path)?;
        }
        self.ctx
            .paths
            .invalidate(Some(&self.database), Some(&self.branch), Some(old));

        if let Some(provider) = self.ctx.encryption() {
            provider.rotate_key(old, new)?;
        }

        info!(
            "Renamed tenant {} to {} on {}/{}",
            old, new, self.database, self.branch
        );
        Ok(())
    }

    /// Copy a tenant within the branch, preserving laziness: copying
    /// a lazy tenant yields another lazy tenant.
    pub fn copy(&self, source: &str, target: &str) -> Result<TenantRecord> {
        validate_name(target, "tenant")?;
        let branch = self.branch_record()?;
        let source_tenant = self.tenant_record(&branch.id, source)?;

        {
            let conn = self.ctx.meta.conn();
            maintenance::check(&conn, &branch.id, &self.branch)?;
            if TenantRecord::get(&conn, &branch.id, target)?.is_some() {
                return Err(Error::AlreadyExists(format!("tenant '{target}'")));
            }
            let mut copied = TenantRecord::new(&branch.id, target, &self.ctx.paths.shard(target));
            copied.materialized = source_tenant.materialized;
            copied.metadata = source_tenant.metadata.clone();
            copied.insert(&conn)?;
        }

        if source_tenant.materialized {
            let source_path = self.tenant_path(source);
            let target_path = self.tenant_path(target);
            if let Some(parent) = target_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source_path, &target_path)?;
        }

        self.tenant_record(&branch.id, target)
    }

    /// Materialize a lazy tenant: copy the branch's `__empty__`
    /// template byte for byte, vacuum the copy, flip the flag.
    /// Idempotent for already-materialized tenants.
    pub fn materialize(&self, name: &str) -> Result<()> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if tenant.materialized {
            return Ok(());
        }

        // Hold the branch lock so the copy sees the latest applied
        // schema and no apply runs mid-copy.
        let lock = MaintenanceLock::acquire(
            &self.ctx.meta,
            &branch.id,
            &self.branch,
            "materializing tenant",
        )?;

        ensure_branch_storage(&self.ctx, &self.database, &branch)?;

        if name != EMPTY_TENANT {
            let empty_path = self.tenant_path(EMPTY_TENANT);
            let path = self.tenant_path(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&empty_path, &path)?;

            let encryption = self.ctx.encryption();
            let conn = connection::open_tenant(&path, &tenant.id, encryption.as_ref())?;
            conn.execute_batch("VACUUM;")?;
        }

        {
            let conn = self.ctx.meta.conn();
            TenantRecord::mark_materialized(&conn, &tenant.id)?;
        }
        lock.release()?;

        info!(
            "Materialized tenant {} on {}/{}",
            name, self.database, self.branch
        );
        Ok(())
    }

    /// Path for read access. Lazy tenants transparently read the
    /// branch's `__empty__` template.
    pub fn get_path_for_read(&self, name: &str) -> Result<PathBuf> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if tenant.materialized {
            Ok(self.tenant_path(name))
        } else {
            ensure_branch_storage(&self.ctx, &self.database, &branch)?;
            Ok(self.tenant_path(EMPTY_TENANT))
        }
    }

    /// Path for write access; materializes a lazy tenant first.
    pub fn get_path_for_write(&self, name: &str) -> Result<PathBuf> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if !tenant.materialized {
            self.materialize(name)?;
        }
        Ok(self.tenant_path(name))
    }

    /// Tenant id for connection-factory callers
    pub(crate) fn tenant_id(&self, name: &str) -> Result<String> {
        let branch = self.branch_record()?;
        Ok(self.tenant_record(&branch.id, name)?.id)
    }

    /// Rebuild the tenant file in place
    pub fn vacuum(&self, name: &str) -> Result<()> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if !tenant.materialized {
            return Ok(());
        }
        let encryption = self.ctx.encryption();
        let conn =
            connection::open_tenant(&self.tenant_path(name), &tenant.id, encryption.as_ref())?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// On-disk size and page size; lazy tenants report zero bytes.
    pub fn size(&self, name: &str) -> Result<StorageInfo> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if !tenant.materialized {
            return Ok(StorageInfo {
                bytes: 0,
                page_size: connection::EMPTY_PAGE_SIZE,
            });
        }

        let path = self.tenant_path(name);
        let bytes = std::fs::metadata(&path)?.len();
        let encryption = self.ctx.encryption();
        let conn = connection::open_tenant(&path, &tenant.id, encryption.as_ref())?;
        let page_size: u32 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(StorageInfo { bytes, page_size })
    }

    /// Compact the tenant file, rebuilding with a larger page size
    /// when the file has outgrown its current one. Returns whether
    /// any compaction ran (always false for lazy tenants).
    pub fn optimize_storage(&self, name: &str) -> Result<bool> {
        let branch = self.branch_record()?;
        let tenant = self.tenant_record(&branch.id, name)?;
        if !tenant.materialized {
            return Ok(false);
        }

        {
            let conn = self.ctx.meta.conn();
            maintenance::check(&conn, &branch.id, &self.branch)?;
        }

        let path = self.tenant_path(name);
        let info = self.size(name)?;
        let target = optimal_page_size(info.bytes);

        if target == info.page_size {
            self.vacuum(name)?;
            return Ok(true);
        }

        // Page size only changes via a rebuild, so VACUUM INTO a
        // sibling file and swap it in.
        let rebuilt = path.with_extension("db.rebuild");
        {
            let encryption = self.ctx.encryption();
            let conn = connection::open_tenant(&path, &tenant.id, encryption.as_ref())?;
            conn.execute_batch(&format!(
                "PRAGMA page_size = {target}; VACUUM INTO '{}';",
                rebuilt.display()
            ))?;
        }
        connection::remove_database_files(&path)?;
        std::fs::rename(&rebuilt, &path)?;

        info!(
            "Rebuilt tenant {} on {}/{} with {target}-byte pages",
            name, self.database, self.branch
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::test_ctx;
    use crate::metadata::models::DatabaseRecord;
    use crate::paths;

    fn seed(ctx: &Arc<EngineCtx>) -> (String, String) {
        let conn = ctx.meta.conn();
        let db = DatabaseRecord::new("app", None);
        db.insert(&conn).unwrap();
        let branch = BranchRecord::new(&db.id, MAIN, None);
        branch.insert(&conn).unwrap();
        let main_tenant = TenantRecord::new(&branch.id, MAIN, &paths::shard_for(MAIN));
        main_tenant.insert(&conn).unwrap();
        let mut empty = TenantRecord::new(&branch.id, EMPTY_TENANT, &paths::shard_for(EMPTY_TENANT));
        empty.metadata = Some(serde_json::json!({"system": true}));
        empty.insert(&conn).unwrap();
        (db.id.clone(), branch.id.clone())
    }

    #[test]
    fn test_optimal_page_size_thresholds() {
        assert_eq!(optimal_page_size(50 * 1024), 512);
        assert_eq!(optimal_page_size(200 * 1024), 1024);
        assert_eq!(optimal_page_size(500 * 1024), 4096);
        assert_eq!(optimal_page_size(50 * 1024 * 1024), 8192);
        assert_eq!(optimal_page_size(200 * 1024 * 1024), 16384);
    }

    #[test]
    fn test_create_lazy_has_no_file() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        let tenant = manager.create("acme", true).unwrap();
        assert!(!tenant.materialized);
        assert!(!paths::tenant_db_path(&ctx.root, "app", MAIN, "acme").exists());
    }

    #[test]
    fn test_create_eager_materializes_from_template() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        let tenant = manager.create("acme", false).unwrap();
        assert!(tenant.materialized);

        let path = paths::tenant_db_path(&ctx.root, "app", MAIN, "acme");
        assert!(path.exists());

        // Created from the 512-byte-page template
        let conn = rusqlite::Connection::open(&path).unwrap();
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap();
        assert_eq!(page_size, 512);
    }

    #[test]
    fn test_lazy_then_materialize_equals_eager() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("lazy1", true).unwrap();
        manager.materialize("lazy1").unwrap();
        manager.create("eager1", false).unwrap();

        let lazy_path = paths::tenant_db_path(&ctx.root, "app", MAIN, "lazy1");
        let eager_path = paths::tenant_db_path(&ctx.root, "app", MAIN, "eager1");
        assert!(lazy_path.exists());
        assert!(eager_path.exists());
        assert_eq!(
            std::fs::metadata(&lazy_path).unwrap().len(),
            std::fs::metadata(&eager_path).unwrap().len()
        );

        // Idempotent
        manager.materialize("lazy1").unwrap();
    }

    #[test]
    fn test_read_path_routes_lazy_to_template() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("acme", true).unwrap();

        let read_path = manager.get_path_for_read("acme").unwrap();
        assert!(read_path.ends_with(format!(
            "{}/{}.db",
            paths::shard_for(EMPTY_TENANT),
            EMPTY_TENANT
        )));

        // Write path materializes first
        let write_path = manager.get_path_for_write("acme").unwrap();
        assert!(write_path.ends_with(format!("{}/acme.db", paths::shard_for("acme"))));
        assert!(write_path.exists());
    }

    #[test]
    fn test_protected_tenants() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx, "app", MAIN);
        assert!(matches!(manager.delete(MAIN), Err(Error::Protected(_))));
        assert!(matches!(manager.delete(EMPTY_TENANT), Err(Error::Protected(_))));
        assert!(matches!(
            manager.rename(MAIN, "other"),
            Err(Error::Protected(_))
        ));
        assert!(matches!(
            manager.rename(EMPTY_TENANT, "other"),
            Err(Error::Protected(_))
        ));
    }

    #[test]
    fn test_list_hides_template() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx, "app", MAIN);
        manager.create("acme", true).unwrap();

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"acme".to_string()));
        assert!(names.contains(&MAIN.to_string()));
        assert!(!names.contains(&EMPTY_TENANT.to_string()));
    }

    #[test]
    fn test_rename_moves_files_between_shards() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("acme", false).unwrap();
        manager.rename("acme", "globex").unwrap();

        assert!(!paths::tenant_db_path(&ctx.root, "app", MAIN, "acme").exists());
        assert!(paths::tenant_db_path(&ctx.root, "app", MAIN, "globex").exists());

        let listed: Vec<String> = manager.list().unwrap().into_iter().map(|t| t.name).collect();
        assert!(listed.contains(&"globex".to_string()));
        assert!(!listed.contains(&"acme".to_string()));
    }

    #[test]
    fn test_copy_preserves_laziness() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("lazy-src", true).unwrap();
        let copy = manager.copy("lazy-src", "lazy-dst").unwrap();
        assert!(!copy.materialized);
        assert!(!paths::tenant_db_path(&ctx.root, "app", MAIN, "lazy-dst").exists());

        manager.create("eager-src", false).unwrap();
        let copy = manager.copy("eager-src", "eager-dst").unwrap();
        assert!(copy.materialized);
        assert!(paths::tenant_db_path(&ctx.root, "app", MAIN, "eager-dst").exists());
    }

    #[test]
    fn test_size_and_optimize() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("lazy1", true).unwrap();
        let info = manager.size("lazy1").unwrap();
        assert_eq!(info.bytes, 0);
        assert!(!manager.optimize_storage("lazy1").unwrap());

        manager.create("acme", false).unwrap();
        let info = manager.size("acme").unwrap();
        assert!(info.bytes > 0);
        assert_eq!(info.page_size, 512);

        // Small file keeps its page size but is vacuumed
        assert!(manager.optimize_storage("acme").unwrap());
        assert_eq!(manager.size("acme").unwrap().page_size, 512);
    }

    #[test]
    fn test_delete_removes_row_and_files() {
        let (_temp, ctx) = test_ctx();
        seed(&ctx);

        let manager = TenantManager::new(ctx.clone(), "app", MAIN);
        manager.create("acme", false).unwrap();
        manager.delete("acme").unwrap();

        assert!(!paths::tenant_db_path(&ctx.root, "app", MAIN, "acme").exists());
        assert!(matches!(manager.size("acme"), Err(Error::NotFound(_))));
    }
}
