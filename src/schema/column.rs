// src/schema/column.rs

//! Column operations: add, drop, rename.
//!
//! `ADD COLUMN` and `RENAME COLUMN` use native `ALTER TABLE`. Drop
//! cannot, in general (indexed or constrained columns), so it runs
//! the canonical shadow-table dance: build a replacement table from
//! the schema snapshot, copy rows, swap names, and rebuild the
//! surviving indexes.

use crate::changes::{ChangeType, EntityType};
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::naming::validate_name;
use crate::schema::table::validate_column;
use crate::schema::{
    Column, SYSTEM_COLUMNS, SchemaOps, create_table_sql, is_system_table, quote_ident,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ColumnManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
}

impl ColumnManager {
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

    /// User columns of a table (system columns excluded)
    pub fn list(&self, table: &str) -> Result<Vec<Column>> {
        let ops = self.ops()?;
        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        Ok(def.columns.clone())
    }

    /// Add a column via native `ALTER TABLE`
    pub fn add(&self, table: &str, column: Column) -> Result<()> {
        if is_system_table(table) {
            return Err(Error::Protected(format!("table '{table}' is reserved")));
        }
        validate_column(&column)?;
        if !column.nullable && column.default.is_none() {
            return Err(Error::InvalidName(format!(
                "column '{}' is NOT NULL and needs a default to be added to an existing table",
                column.name
            )));
        }

        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        if def.has_column(&column.name) {
            return Err(Error::AlreadyExists(format!(
                "column '{}' on table '{table}'",
                column.name
            )));
        }

        let entity = format!("{table}.{}", column.name);
        let mut change = ops.new_change(ChangeType::AddColumn, EntityType::Column, &entity);
        change.details = Some(serde_json::json!({ "table": table, "column": column }));
        change.sql = Some(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column.definition_sql()
        ));
        ops.emit(&mut change)
    }

    /// Drop a column via the shadow-table dance
    pub fn drop(&self, table: &str, column: &str) -> Result<()> {
        if is_system_table(table) {
            return Err(Error::Protected(format!("table '{table}' is reserved")));
        }
        if SYSTEM_COLUMNS.contains(&column) {
            return Err(Error::Protected(format!(
                "column '{column}' is a system column"
            )));
        }

        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        if def.column(column).is_none() {
            return Err(Error::NotFound(format!(
                "column '{column}' on table '{table}'"
            )));
        }

        let remaining: Vec<Column> = def
            .columns
            .iter()
            .filter(|c| c.name != column)
            .cloned()
            .collect();

        let shadow = format!("{table}_rebuild");
        let mut col_names: Vec<String> = SYSTEM_COLUMNS.iter().map(|c| quote_ident(c)).collect();
        col_names.extend(remaining.iter().map(|c| quote_ident(&c.name)));
        let col_list = col_names.join(", ");

        let mut statements = vec![
            format!("{};", create_table_sql(&shadow, &remaining)),
            format!(
                "INSERT INTO {} ({col_list}) SELECT {col_list} FROM {};",
                quote_ident(&shadow),
                quote_ident(table)
            ),
            format!("DROP TABLE {};", quote_ident(table)),
            format!(
                "ALTER TABLE {} RENAME TO {};",
                quote_ident(&shadow),
                quote_ident(table)
            ),
        ];
        // Rebuild indexes that survive the drop
        for index in snapshot.indexes_for(table) {
            if !index.columns.iter().any(|c| c == column) {
                statements.push(format!("{};", index.create_sql()));
            }
        }

        let entity = format!("{table}.{column}");
        let mut change = ops.new_change(ChangeType::DropColumn, EntityType::Column, &entity);
        change.details = Some(serde_json::json!({ "table": table, "column": column }));
        change.sql = Some(statements.join("\n"));
        ops.emit(&mut change)
    }

    /// Rename a column via native `ALTER TABLE ... RENAME COLUMN`
    pub fn rename(&self, table: &str, old: &str, new: &str) -> Result<()> {
        if is_system_table(table) {
            return Err(Error::Protected(format!("table '{table}' is reserved")));
        }
        if SYSTEM_COLUMNS.contains(&old) {
            return Err(Error::Protected(format!(
                "column '{old}' is a system column"
            )));
        }
        validate_name(new, "column")?;
        if SYSTEM_COLUMNS.contains(&new) {
            return Err(Error::InvalidName(format!(
                "column '{new}' is a system column name"
            )));
        }

        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        if def.column(old).is_none() {
            return Err(Error::NotFound(format!(
                "column '{old}' on table '{table}'"
            )));
        }
        if def.has_column(new) {
            return Err(Error::AlreadyExists(format!(
                "column '{new}' on table '{table}'"
            )));
        }

        let entity = format!("{table}.{old}");
        let mut change = ops.new_change(ChangeType::RenameColumn, EntityType::Column, &entity);
        change.details = Some(serde_json::json!({ "table": table, "old": old, "new": new }));
        change.sql = Some(format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(table),
            quote_ident(old),
            quote_ident(new)
        ));
        ops.emit(&mut change)
    }
}
