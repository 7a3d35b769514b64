// src/metadata/mod.rs

//! Metadata index for a project.
//!
//! A single SQLite file under the hidden state directory enumerates
//! every database, branch, tenant, and change in the project. All
//! listings and existence checks go through this index without
//! touching tenant files. Access is funneled through a per-project
//! shared connection handed out by [`pool`].

pub mod models;
pub mod pool;
pub mod schema;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/// Open (creating if necessary) the metadata index at `path` and
/// bring its schema up to date.
///
/// New index files are created with 1 KiB pages to keep the file
/// small for projects with few entities.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let fresh = !path.exists();
    let conn = Connection::open(path)?;

    if fresh {
        debug!("Creating metadata index at {}", path.display());
        conn.execute_batch("PRAGMA page_size = 1024;")?;
    }

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA cache_size = -2000;
        ",
    )?;

    schema::migrate(&conn)?;

    Ok(conn)
}
