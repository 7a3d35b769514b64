// src/metadata/pool.rs

//! Per-project singleton pool for the metadata connection.
//!
//! SQLite in serialized mode handles concurrent statements on one
//! connection; the pool guarantees every manager in the process
//! shares that single handle per project, keyed by canonicalized
//! project root. Entries are held weakly so the connection closes
//! when the last engine handle drops; [`close_all`] clears the map
//! for tests.

use crate::error::Result;
use crate::paths;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};
use tracing::debug;

static POOL: LazyLock<Mutex<HashMap<PathBuf, Weak<PoolEntry>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct PoolEntry {
    root: PathBuf,
    conn: Mutex<Connection>,
}

/// Shared handle to a project's metadata connection.
///
/// Cloning is cheap; all clones share one serialized connection.
#[derive(Debug, Clone)]
pub struct MetadataHandle {
    entry: Arc<PoolEntry>,
}

impl MetadataHandle {
    /// Lock the shared connection for a sequence of statements.
    ///
    /// Keep the guard short-lived; never hold it across tenant I/O.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.entry.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Project root this handle belongs to
    pub fn project_root(&self) -> &Path {
        &self.entry.root
    }
}

/// Get (or open) the shared metadata handle for a project root.
pub fn metadata_handle(project_root: &Path) -> Result<MetadataHandle> {
    let key = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = pool.get(&key).and_then(Weak::upgrade) {
        return Ok(MetadataHandle { entry: existing });
    }

    debug!("Opening metadata pool entry for {}", key.display());
    let conn = super::open(&paths::metadata_db_path(&key))?;
    let entry = Arc::new(PoolEntry {
        root: key.clone(),
        conn: Mutex::new(conn),
    });
    pool.insert(key, Arc::downgrade(&entry));

    Ok(MetadataHandle { entry })
}

/// Drop all pooled entries. Live handles keep working; the next
/// `metadata_handle` call opens a fresh connection.
pub fn close_all() {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.clear();
}
