// src/changes/tracker.rs

//! Per-branch append-only change log.
//!
//! The tracker is the single source of truth for a branch's schema:
//! appending assigns the next `applied_order`, and every query view
//! (full list, unapplied suffix, changes since an id) reads through
//! the ordered link table.

use crate::changes::Change;
use crate::engine::EngineCtx;
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChangeTracker {
    ctx: Arc<EngineCtx>,
    branch_id: String,
}

impl ChangeTracker {
    pub(crate) fn new(ctx: Arc<EngineCtx>, branch_id: &str) -> Self {
        Self {
            ctx,
            branch_id: branch_id.to_string(),
        }
    }

    /// Append a change to the branch: insert the global row, assign
    /// the next order rank, and link it with `applied = false`.
    pub fn append(&self, change: &mut Change) -> Result<()> {
        let conn = self.ctx.meta.conn();
        change.applied = false;
        change.copied_from_branch_id = None;
        change.insert(&conn)?;
        let order = Change::next_order(&conn, &self.branch_id)?;
        Change::link(&conn, &self.branch_id, &change.id, false, order, None)?;
        change.applied_order = order;
        debug!(
            "Appended change {} ({}) to branch {} at order {order}",
            change.id,
            change.change_type.as_str(),
            self.branch_id
        );
        Ok(())
    }

    /// All changes in `applied_order` ascending
    pub fn list(&self) -> Result<Vec<Change>> {
        let conn = self.ctx.meta.conn();
        Change::list_for_branch(&conn, &self.branch_id)
    }

    /// Changes not yet applied to the branch's tenants
    pub fn unapplied(&self) -> Result<Vec<Change>> {
        Ok(self.list()?.into_iter().filter(|c| !c.applied).collect())
    }

    /// Flip the applied flag (idempotent)
    pub fn mark_applied(&self, change_id: &str) -> Result<()> {
        let conn = self.ctx.meta.conn();
        Change::mark_applied(&conn, &self.branch_id, change_id)
    }

    /// The suffix of the log after `change_id`; empty when the id is
    /// not in this branch's history.
    pub fn since(&self, change_id: &str) -> Result<Vec<Change>> {
        let changes = self.list()?;
        match changes.iter().position(|c| c.id == change_id) {
            Some(index) => Ok(changes.into_iter().skip(index + 1).collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Whether the branch history contains a change id
    pub fn contains(&self, change_id: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|c| c.id == change_id))
    }

    /// Unlink a change from this branch, keeping the global row for
    /// other branches. Returns whether a link was removed.
    pub fn remove(&self, change_id: &str) -> Result<bool> {
        let conn = self.ctx.meta.conn();
        Change::unlink(&conn, &self.branch_id, change_id)
    }

    /// Remove every link row for the branch; global change rows stay.
    pub fn clear(&self) -> Result<()> {
        let conn = self.ctx.meta.conn();
        Change::clear_links(&conn, &self.branch_id)
    }

    /// Copy the full history of `source_branch_id` onto
    /// `target_branch_id`, preserving order and applied status.
    pub(crate) fn copy_from(
        ctx: &EngineCtx,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<usize> {
        let conn = ctx.meta.conn();
        Change::copy_links(&conn, source_branch_id, target_branch_id)
    }
}
