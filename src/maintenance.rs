// src/maintenance.rs

//! Branch maintenance lock.
//!
//! A row in `branch_maintenance` serializes writers against a
//! branch. Writers acquire the row before mutating; readers proceed
//! without it. The guard releases the row on drop so an error path
//! cannot leave a branch locked within a live process. A process
//! killed mid-apply leaves the row behind, which is exactly the
//! "maintenance in progress" signal the next writer should see until
//! an operator intervenes.

use crate::error::{Error, Result};
use crate::metadata::models::now_utc;
use crate::metadata::pool::MetadataHandle;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

/// Fail fast if the branch is currently under maintenance.
pub fn check(conn: &Connection, branch_id: &str, branch_name: &str) -> Result<()> {
    let reason: Option<String> = conn
        .query_row(
            "SELECT reason FROM branch_maintenance WHERE branch_id = ?1",
            [branch_id],
            |row| row.get(0),
        )
        .optional()?;

    match reason {
        Some(reason) => Err(Error::MaintenanceInProgress {
            branch: branch_name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// RAII guard over the `branch_maintenance` row.
#[derive(Debug)]
pub struct MaintenanceLock {
    meta: MetadataHandle,
    branch_id: String,
    released: bool,
}

impl MaintenanceLock {
    /// Acquire the lock, failing with `MaintenanceInProgress` when
    /// another actor holds it.
    pub fn acquire(
        meta: &MetadataHandle,
        branch_id: &str,
        branch_name: &str,
        reason: &str,
    ) -> Result<Self> {
        {
            let conn = meta.conn();
            check(&conn, branch_id, branch_name)?;
            conn.execute(
                "INSERT INTO branch_maintenance (branch_id, reason, started_at) VALUES (?1, ?2, ?3)",
                params![branch_id, reason, now_utc()],
            )?;
        }
        debug!("Maintenance lock acquired on branch {branch_name}: {reason}");

        Ok(Self {
            meta: meta.clone(),
            branch_id: branch_id.to_string(),
            released: false,
        })
    }

    /// Release explicitly, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        let conn = self.meta.conn();
        conn.execute(
            "DELETE FROM branch_maintenance WHERE branch_id = ?1",
            [self.branch_id.as_str()],
        )?;
        Ok(())
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let conn = self.meta.conn();
        if let Err(e) = conn.execute(
            "DELETE FROM branch_maintenance WHERE branch_id = ?1",
            [self.branch_id.as_str()],
        ) {
            warn!("Failed to release maintenance lock for {}: {e}", self.branch_id);
        }
    }
}
