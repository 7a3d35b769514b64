// src/changes/applier.rs

//! Transactional fan-out of schema changes to a branch's tenants.
//!
//! Changes apply in branch order under the maintenance lock. Within a
//! change every materialized tenant (the `__empty__` template
//! included) runs the DDL in its own transaction; a failing tenant
//! stops the fan-out and leaves the change unapplied, so a retried
//! apply resumes from the first unapplied change.

use crate::changes::tracker::ChangeTracker;
use crate::changes::{Change, ChangeType};
use crate::connection;
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::maintenance::MaintenanceLock;
use crate::metadata::models::TenantRecord;
use crate::schema::{Column, quote_ident};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ChangeApplier {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
    branch_id: String,
}

impl ChangeApplier {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str, branch: &str, branch_id: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
            branch: branch.to_string(),
            branch_id: branch_id.to_string(),
        }
    }

    /// Apply all unapplied changes under the branch maintenance lock.
    /// Returns the number of changes applied.
    pub fn apply_unapplied(&self) -> Result<usize> {
        let lock = MaintenanceLock::acquire(
            &self.ctx.meta,
            &self.branch_id,
            &self.branch,
            "applying schema changes",
        )?;
        let applied = self.apply_unapplied_locked()?;
        lock.release()?;
        Ok(applied)
    }

    /// Apply all unapplied changes assuming the caller already holds
    /// the branch maintenance lock (merge holds it end-to-end).
    pub(crate) fn apply_unapplied_locked(&self) -> Result<usize> {
        let tracker = ChangeTracker::new(self.ctx.clone(), &self.branch_id);
        let pending = tracker.unapplied()?;
        if pending.is_empty() {
            return Ok(0);
        }

        info!(
            "Applying {} change(s) to branch {}/{}",
            pending.len(),
            self.database,
            self.branch
        );

        for change in &pending {
            self.apply_to_tenants(change)?;
            tracker.mark_applied(&change.id)?;
            debug!("Change {} marked applied", change.id);
        }

        Ok(pending.len())
    }

    /// Fan one change out to every materialized tenant of the branch.
    fn apply_to_tenants(&self, change: &Change) -> Result<()> {
        let sql = sql_for(change)?;
        let tenants = {
            let conn = self.ctx.meta.conn();
            TenantRecord::list_materialized(&conn, &self.branch_id)?
        };

        for tenant in &tenants {
            let path = self
                .ctx
                .paths
                .tenant_db(&self.ctx.root, &self.database, &self.branch, &tenant.name);
            let encryption = self.ctx.encryption();
            let mut conn = connection::open_tenant(&path, &tenant.id, encryption.as_ref())
                .map_err(|e| Error::SchemaError {
                    change_id: change.id.clone(),
                    tenant: tenant.name.clone(),
                    message: e.to_string(),
                })?;

            let tx = conn.transaction()?;
            tx.execute_batch(&sql).map_err(|e| Error::SchemaError {
                change_id: change.id.clone(),
                tenant: tenant.name.clone(),
                message: e.to_string(),
            })?;
            tx.commit()?;

            debug!(
                "Change {} applied to tenant {} on {}/{}",
                change.id, tenant.name, self.database, self.branch
            );
        }

        Ok(())
    }
}

/// The DDL script for a change: its stored SQL, or SQL synthesized
/// from structured details for changes that carry none.
pub fn sql_for(change: &Change) -> Result<String> {
    if let Some(sql) = &change.sql {
        return Ok(sql.clone());
    }

    match change.change_type {
        ChangeType::AddColumn => {
            let details = change.details.as_ref().ok_or_else(|| Error::SchemaError {
                change_id: change.id.clone(),
                tenant: String::new(),
                message: "ADD_COLUMN change has neither SQL nor details".to_string(),
            })?;
            let table = details
                .get("table")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::SchemaError {
                    change_id: change.id.clone(),
                    tenant: String::new(),
                    message: "missing 'table' in ADD_COLUMN details".to_string(),
                })?;
            let column: Column = serde_json::from_value(details["column"].clone())?;
            Ok(format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column.definition_sql()
            ))
        }
        _ => Err(Error::SchemaError {
            change_id: change.id.clone(),
            tenant: String::new(),
            message: format!(
                "{} change carries no SQL and cannot be synthesized",
                change.change_type.as_str()
            ),
        }),
    }
}
