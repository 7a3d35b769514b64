// src/schema/view.rs

//! View operations. An update is a drop followed by a create inside
//! one logical change, so a branch's history stays one-entry-per-edit.

use crate::changes::{ChangeType, EntityType};
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::naming::validate_name;
use crate::schema::{SchemaOps, quote_ident};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ViewManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
}

fn validate_select(name: &str, select: &str) -> Result<()> {
    let trimmed = select.trim();
    if !trimmed.to_ascii_uppercase().starts_with("SELECT") {
        return Err(Error::SqlValidation(format!(
            "view '{name}' must be defined by a SELECT statement"
        )));
    }
    Ok(())
}

impl ViewManager {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str, branch: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
            branch: branch.to_string(),
        }
    }

    fn ops(&self) -> Result<SchemaOps> {
        SchemaOps::resolve(self.ctx.clone(), &self.database, &self.branch)
    }

    /// Views of the branch as `(name, select)` pairs
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let ops = self.ops()?;
        Ok(ops.snapshot()?.views.into_iter().collect())
    }

    pub fn create(&self, name: &str, select: &str) -> Result<()> {
        validate_name(name, "view")?;
        validate_select(name, select)?;
        let ops = self.ops()?;
        ops.check_maintenance()?;

        if ops.snapshot()?.views.contains_key(name) {
            return Err(Error::AlreadyExists(format!("view '{name}'")));
        }

        let mut change = ops.new_change(ChangeType::CreateView, EntityType::View, name);
        change.details = Some(serde_json::json!({ "select": select }));
        change.sql = Some(format!(
            "CREATE VIEW {} AS {}",
            quote_ident(name),
            select.trim()
        ));
        ops.emit(&mut change)
    }

    /// Replace a view's definition in one change
    pub fn update(&self, name: &str, select: &str) -> Result<()> {
        validate_select(name, select)?;
        let ops = self.ops()?;
        ops.check_maintenance()?;

        if !ops.snapshot()?.views.contains_key(name) {
            return Err(Error::NotFound(format!("view '{name}'")));
        }

        let mut change = ops.new_change(ChangeType::UpdateView, EntityType::View, name);
        change.details = Some(serde_json::json!({ "select": select }));
        change.sql = Some(format!(
            "DROP VIEW {};\nCREATE VIEW {} AS {};",
            quote_ident(name),
            quote_ident(name),
            select.trim()
        ));
        ops.emit(&mut change)
    }

    pub fn drop(&self, name: &str) -> Result<()> {
        let ops = self.ops()?;
        ops.check_maintenance()?;

        if !ops.snapshot()?.views.contains_key(name) {
            return Err(Error::NotFound(format!("view '{name}'")));
        }

        let mut change = ops.new_change(ChangeType::DropView, EntityType::View, name);
        change.sql = Some(format!("DROP VIEW {}", quote_ident(name)));
        ops.emit(&mut change)
    }
}
