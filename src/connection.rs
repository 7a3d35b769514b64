// src/connection.rs

//! Connection factory for tenant SQLite files.
//!
//! Every tenant connection gets the same pragma profile: WAL
//! journaling, relaxed-but-safe synchronization, in-memory temp
//! storage, enforced foreign keys, and a small page cache. When an
//! encryption provider is registered its key pragma runs before any
//! other statement.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Page size used for freshly created (empty) tenant files. Empty
/// databases stay around 1-2 KiB on disk at this size.
pub const EMPTY_PAGE_SIZE: u32 = 512;

/// Optional hook applied to every tenant connection before use.
///
/// The core never implements a cipher; providers typically issue a
/// `PRAGMA key` backed by the opaque `encryption_keys` metadata
/// table. Failure to apply a key aborts the connection.
pub trait EncryptionProvider: Send + Sync {
    /// Apply the key pragma for a tenant. Runs before any other
    /// statement on the connection.
    fn apply_key(&self, conn: &Connection, tenant_id: &str) -> Result<()>;

    /// Re-wrap key material when a tenant is renamed.
    fn rotate_key(&self, old_tenant_id: &str, new_tenant_id: &str) -> Result<()> {
        let _ = (old_tenant_id, new_tenant_id);
        Ok(())
    }
}

impl std::fmt::Debug for dyn EncryptionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionProvider")
    }
}

/// Open a tenant database file with the standard pragma profile.
pub fn open_tenant(
    path: &Path,
    tenant_id: &str,
    provider: Option<&Arc<dyn EncryptionProvider>>,
) -> Result<Connection> {
    let conn = Connection::open(path)?;

    if let Some(provider) = provider {
        if let Err(e) = provider.apply_key(&conn, tenant_id) {
            drop(conn);
            return Err(Error::Encryption(format!(
                "failed to apply key for tenant {tenant_id}: {e}"
            )));
        }
    }

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA cache_size = -2000;
        ",
    )?;

    Ok(conn)
}

/// Create a new empty database file with the given page size.
///
/// The page size must be fixed before the first page is written;
/// the empty `VACUUM` materializes the file header at that size.
pub fn create_database_file(path: &Path, page_size: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    debug!(
        "Creating database file {} with page size {}",
        path.display(),
        page_size
    );
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!("PRAGMA page_size = {page_size}; VACUUM;"))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    Ok(())
}

/// Remove a database file together with its WAL and SHM sidecars.
pub fn remove_database_files(path: &Path) -> Result<()> {
    for candidate in [
        path.to_path_buf(),
        sidecar(path, "-wal"),
        sidecar(path, "-shm"),
    ] {
        if candidate.exists() {
            std::fs::remove_file(&candidate)?;
        }
    }
    Ok(())
}

/// Rename a database file together with its WAL and SHM sidecars.
pub fn rename_database_files(old: &Path, new: &Path) -> Result<()> {
    if let Some(parent) = new.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(old, new)?;
    for suffix in ["-wal", "-shm"] {
        let old_side = sidecar(old, suffix);
        if old_side.exists() {
            std::fs::rename(old_side, sidecar(new, suffix))?;
        }
    }
    Ok(())
}

fn sidecar(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}
