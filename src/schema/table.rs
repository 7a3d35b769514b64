// src/schema/table.rs

//! Table operations: create, drop, rename, copy.
//!
//! Every user table gains the implicit `id`/`created_at`/`updated_at`
//! system columns. Names beginning with `__` or `sqlite_` are
//! reserved for internal bookkeeping and rejected here; system tables
//! never show up in listings even when they exist on disk.

use crate::changes::{ChangeType, EntityType};
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::naming::validate_name;
use crate::schema::{
    Column, IndexDef, SchemaOps, SYSTEM_COLUMNS, create_table_sql, is_system_table, quote_ident,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TableManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
}

/// Validate a user-facing table name
pub(crate) fn validate_table_name(name: &str) -> Result<()> {
    if is_system_table(name) {
        return Err(Error::InvalidName(format!(
            "table name '{name}' uses a reserved prefix"
        )));
    }
    validate_name(name, "table")
}

/// Validate a user-supplied column definition
pub(crate) fn validate_column(column: &Column) -> Result<()> {
    if SYSTEM_COLUMNS.contains(&column.name.as_str()) {
        return Err(Error::InvalidName(format!(
            "column '{}' is a system column and cannot be supplied",
            column.name
        )));
    }
    validate_name(&column.name, "column")
}

impl TableManager {
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

    /// User tables of the branch, system tables excluded
    pub fn list(&self) -> Result<Vec<String>> {
        let ops = self.ops()?;
        Ok(ops
            .snapshot()?
            .table_names()
            .into_iter()
            .filter(|n| !is_system_table(n))
            .collect())
    }

    /// User columns of a table (the implicit system columns are
    /// always present and not listed)
    pub fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let ops = self.ops()?;
        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        Ok(def.columns.clone())
    }

    /// Create a table with the given user columns and optional
    /// indexes, fan the DDL out to every materialized tenant.
    pub fn create(
        &self,
        name: &str,
        columns: Vec<Column>,
        indexes: Option<Vec<(Vec<String>, bool)>>,
    ) -> Result<()> {
        validate_table_name(name)?;
        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        if snapshot.has_table(name) {
            return Err(Error::AlreadyExists(format!("table '{name}'")));
        }

        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            validate_column(column)?;
            if !seen.insert(column.name.clone()) {
                return Err(Error::AlreadyExists(format!(
                    "column '{}' appears twice",
                    column.name
                )));
            }
            if let Some(fk) = &column.foreign_key {
                let target = snapshot.table(&fk.table).ok_or_else(|| {
                    Error::NotFound(format!(
                        "foreign key target table '{}' for column '{}'",
                        fk.table, column.name
                    ))
                })?;
                if !target.has_column(&fk.column) {
                    return Err(Error::NotFound(format!(
                        "foreign key target column '{}.{}'",
                        fk.table, fk.column
                    )));
                }
            }
        }

        let mut statements = vec![format!("{};", create_table_sql(name, &columns))];
        let mut index_defs = Vec::new();
        if let Some(indexes) = indexes {
            for (cols, unique) in indexes {
                let index = build_index_def(name, &cols, None, unique, &columns)?;
                statements.push(format!("{};", index.create_sql()));
                index_defs.push(index);
            }
        }

        let mut change = ops.new_change(ChangeType::CreateTable, EntityType::Table, name);
        change.details = Some(serde_json::json!({
            "columns": columns,
            "indexes": index_defs,
        }));
        change.sql = Some(statements.join("\n"));
        ops.emit(&mut change)?;

        // Index definitions ride along in the table DDL but are
        // tracked individually so the snapshot can rebuild them.
        for index in index_defs {
            let mut index_change =
                ops.new_change(ChangeType::CreateIndex, EntityType::Index, &index.name);
            index_change.details = Some(serde_json::to_value(&index)?);
            index_change.sql = Some(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&index.name),
                quote_ident(&index.table),
                index
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            ops.emit(&mut index_change)?;
        }

        Ok(())
    }

    /// Drop a table
    pub fn drop(&self, name: &str) -> Result<()> {
        if is_system_table(name) {
            return Err(Error::Protected(format!("table '{name}' is reserved")));
        }
        let ops = self.ops()?;
        ops.check_maintenance()?;

        if !ops.snapshot()?.has_table(name) {
            return Err(Error::NotFound(format!("table '{name}'")));
        }

        let mut change = ops.new_change(ChangeType::DropTable, EntityType::Table, name);
        change.sql = Some(format!("DROP TABLE {}", quote_ident(name)));
        ops.emit(&mut change)
    }

    /// Rename a table
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if is_system_table(old) {
            return Err(Error::Protected(format!("table '{old}' is reserved")));
        }
        validate_table_name(new)?;
        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        if !snapshot.has_table(old) {
            return Err(Error::NotFound(format!("table '{old}'")));
        }
        if snapshot.has_table(new) {
            return Err(Error::AlreadyExists(format!("table '{new}'")));
        }

        let mut change = ops.new_change(ChangeType::RenameTable, EntityType::Table, old);
        change.details = Some(serde_json::json!({ "new_name": new }));
        change.sql = Some(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(old),
            quote_ident(new)
        ));
        ops.emit(&mut change)
    }

    /// Copy a table's schema (and optionally its rows) to a new name
    pub fn copy(&self, source: &str, target: &str, include_data: bool) -> Result<()> {
        validate_table_name(target)?;
        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(source)
            .ok_or_else(|| Error::NotFound(format!("table '{source}'")))?;
        if snapshot.has_table(target) {
            return Err(Error::AlreadyExists(format!("table '{target}'")));
        }

        let columns = def.columns.clone();
        let mut statements = vec![format!("{};", create_table_sql(target, &columns))];
        if include_data {
            let mut names: Vec<String> = SYSTEM_COLUMNS.iter().map(|c| quote_ident(c)).collect();
            names.extend(columns.iter().map(|c| quote_ident(&c.name)));
            let list = names.join(", ");
            statements.push(format!(
                "INSERT INTO {} ({list}) SELECT {list} FROM {};",
                quote_ident(target),
                quote_ident(source)
            ));
        }

        let mut change = ops.new_change(ChangeType::CreateTable, EntityType::Table, target);
        change.details = Some(serde_json::json!({
            "columns": columns,
            "copied_from": source,
            "include_data": include_data,
        }));
        change.sql = Some(statements.join("\n"));
        ops.emit(&mut change)
    }
}

/// Resolve an index definition against a table's user columns,
/// generating a name when none is supplied.
pub(crate) fn build_index_def(
    table: &str,
    columns: &[String],
    name: Option<&str>,
    unique: bool,
    table_columns: &[Column],
) -> Result<IndexDef> {
    if columns.is_empty() {
        return Err(Error::InvalidName(
            "index requires at least one column".into(),
        ));
    }
    for col in columns {
        let known = SYSTEM_COLUMNS.contains(&col.as_str())
            || table_columns.iter().any(|c| &c.name == col);
        if !known {
            return Err(Error::NotFound(format!(
                "column '{col}' on table '{table}'"
            )));
        }
    }

    let name = match name {
        Some(name) => {
            validate_name(name, "index")?;
            name.to_string()
        }
        None => {
            let prefix = if unique { "uniq" } else { "idx" };
            format!("{prefix}_{table}_{}", columns.join("_"))
        }
    };

    Ok(IndexDef {
        name,
        table: table.to_string(),
        columns: columns.to_vec(),
        unique,
    })
}
