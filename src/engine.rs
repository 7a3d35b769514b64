// src/engine.rs

//! Engine facade: the contract the CLI/HTTP/codegen layers consume.
//!
//! A `CinchDb` handle owns a project's shared metadata connection,
//! path cache, and optional encryption provider; scoped manager
//! accessors hand out plain record types over that shared context.
//! Dropping the last handle for a project closes its metadata
//! connection.

use crate::branch::BranchManager;
use crate::changes::comparator::ChangeComparator;
use crate::config;
use crate::connection::EncryptionProvider;
use crate::error::{Error, Result};
use crate::metadata::models::DatabaseRecord;
use crate::metadata::pool::{self, MetadataHandle};
use crate::paths::{self, PathCache};
use crate::project;
use crate::query::QueryManager;
use crate::schema::column::ColumnManager;
use crate::schema::index::IndexManager;
use crate::schema::table::TableManager;
use crate::schema::view::ViewManager;
use crate::tenant::TenantManager;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared state every manager borrows: project root, metadata pool
/// handle, path cache, and the optional encryption provider slot.
#[derive(Debug)]
pub struct EngineCtx {
    pub(crate) root: PathBuf,
    pub(crate) meta: MetadataHandle,
    pub(crate) paths: PathCache,
    pub(crate) encryption: Mutex<Option<Arc<dyn EncryptionProvider>>>,
}

impl EngineCtx {
    pub(crate) fn encryption(&self) -> Option<Arc<dyn EncryptionProvider>> {
        self.encryption
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Handle to a CinchDB project
#[derive(Debug, Clone)]
pub struct CinchDb {
    ctx: Arc<EngineCtx>,
}

impl CinchDb {
    fn from_handle(root: PathBuf, meta: MetadataHandle) -> Self {
        Self {
            ctx: Arc::new(EngineCtx {
                root,
                meta,
                paths: PathCache::new(),
                encryption: Mutex::new(None),
            }),
        }
    }

    /// Initialize a project at `root` (idempotent) and open it
    pub fn init(root: &Path) -> Result<Self> {
        let meta = project::init_state(root)?;
        Ok(Self::from_handle(root.to_path_buf(), meta))
    }

    /// Open an existing project
    pub fn open(root: &Path) -> Result<Self> {
        if !paths::metadata_db_path(root).exists() {
            return Err(Error::NotFound(format!(
                "no CinchDB project at {}",
                root.display()
            )));
        }
        let meta = pool::metadata_handle(root)?;
        Ok(Self::from_handle(root.to_path_buf(), meta))
    }

    /// Open the project containing `start`, honoring
    /// `CINCHDB_PROJECT_DIR`.
    pub fn discover(start: &Path) -> Result<Self> {
        let root = config::find_project_root(start)?;
        Self::open(&root)
    }

    pub fn project_root(&self) -> &Path {
        &self.ctx.root
    }

    /// Register the encryption provider consulted by the connection
    /// factory.
    pub fn set_encryption_provider(&self, provider: Arc<dyn EncryptionProvider>) {
        *self
            .ctx
            .encryption
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    // Databases

    pub fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        let conn = self.ctx.meta.conn();
        DatabaseRecord::list(&conn)
    }

    pub fn init_database(
        &self,
        name: &str,
        description: Option<&str>,
        lazy: bool,
    ) -> Result<DatabaseRecord> {
        project::init_database(&self.ctx, name, description, lazy)
    }

    pub fn materialize_database(&self, name: &str) -> Result<()> {
        project::materialize_database(&self.ctx, name)
    }

    pub fn delete_database(&self, name: &str) -> Result<()> {
        project::delete_database(&self.ctx, name)
    }

    // Scoped managers

    pub fn branches(&self, database: &str) -> BranchManager {
        BranchManager::new(self.ctx.clone(), database)
    }

    pub fn tenants(&self, database: &str, branch: &str) -> TenantManager {
        TenantManager::new(self.ctx.clone(), database, branch)
    }

    pub fn tables(&self, database: &str, branch: &str) -> TableManager {
        TableManager::new(self.ctx.clone(), database, branch)
    }

    pub fn columns(&self, database: &str, branch: &str) -> ColumnManager {
        ColumnManager::new(self.ctx.clone(), database, branch)
    }

    pub fn views(&self, database: &str, branch: &str) -> ViewManager {
        ViewManager::new(self.ctx.clone(), database, branch)
    }

    pub fn indexes(&self, database: &str, branch: &str) -> IndexManager {
        IndexManager::new(self.ctx.clone(), database, branch)
    }

    pub fn comparator(&self, database: &str) -> ChangeComparator {
        ChangeComparator::new(self.ctx.clone(), database)
    }

    pub fn query(&self, database: &str, branch: &str, tenant: &str) -> QueryManager {
        QueryManager::new(self.ctx.clone(), database, branch, tenant)
    }

    /// Tear down every pooled metadata connection (tests)
    pub fn close_all() {
        pool::close_all();
    }
}
