// src/schema/mod.rs

//! Schema entity models, SQL builders, and the per-branch snapshot.
//!
//! The snapshot is rebuilt by replaying a branch's change list; merge
//! planning replays a candidate plan against it to prove each change
//! is legal in the target branch, and the column managers use it to
//! reconstruct tables during the shadow-copy dance.

pub mod column;
pub mod index;
pub mod table;
pub mod view;

use crate::changes::{Change, ChangeType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Implicit columns every user table carries. They are managed by the
/// engine and forbidden in user-supplied column lists.
pub const SYSTEM_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Quote an identifier for embedding in SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Tables prefixed `__` or `sqlite_` are reserved for internal
/// bookkeeping and hidden from listings.
pub fn is_system_table(name: &str) -> bool {
    name.starts_with("__") || name.starts_with("sqlite_")
}

/// Storage classes accepted for user columns. `BOOLEAN` is a
/// first-class alias stored as `INTEGER 0/1` with a CHECK constraint
/// so it survives schema reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Numeric,
    Boolean,
}

impl ColumnType {
    /// The type name used in generated DDL
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Boolean => "INTEGER",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TEXT" => Ok(ColumnType::Text),
            "INTEGER" | "INT" => Ok(ColumnType::Integer),
            "REAL" => Ok(ColumnType::Real),
            "BLOB" => Ok(ColumnType::Blob),
            "NUMERIC" => Ok(ColumnType::Numeric),
            "BOOLEAN" | "BOOL" => Ok(ColumnType::Boolean),
            _ => Err(format!("Invalid column type: {}", s)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Referential action for foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FkAction {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl FkAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::SetDefault => "SET DEFAULT",
            FkAction::Restrict => "RESTRICT",
            FkAction::NoAction => "NO ACTION",
        }
    }
}

impl FromStr for FkAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CASCADE" => Ok(FkAction::Cascade),
            "SET NULL" => Ok(FkAction::SetNull),
            "SET DEFAULT" => Ok(FkAction::SetDefault),
            "RESTRICT" => Ok(FkAction::Restrict),
            "NO ACTION" => Ok(FkAction::NoAction),
            _ => Err(format!("Invalid foreign key action: {}", s)),
        }
    }
}

/// Compact foreign key specifier attached to a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    #[serde(default = "default_fk_column")]
    pub column: String,
    #[serde(default = "default_fk_action")]
    pub on_delete: FkAction,
}

fn default_fk_column() -> String {
    "id".to_string()
}

fn default_fk_action() -> FkAction {
    FkAction::NoAction
}

fn default_true() -> bool {
    true
}

/// A user column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub foreign_key: Option<ForeignKeyRef>,
}

impl Column {
    pub fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            nullable: true,
            default: None,
            unique: false,
            foreign_key: None,
        }
    }

    /// Column clause for generated DDL
    pub fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.col_type.sql_type());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        if self.col_type == ColumnType::Boolean {
            sql.push_str(&format!(" CHECK ({} IN (0, 1))", quote_ident(&self.name)));
        }
        if let Some(fk) = &self.foreign_key {
            sql.push_str(&format!(
                " REFERENCES {}({}) ON DELETE {}",
                quote_ident(&fk.table),
                quote_ident(&fk.column),
                fk.on_delete.as_sql()
            ));
        }
        sql
    }
}

/// A secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn create_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
            cols
        )
    }
}

/// Clauses for the implicit system columns
fn system_column_defs() -> Vec<String> {
    vec![
        "\"id\" TEXT PRIMARY KEY".to_string(),
        "\"created_at\" TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string(),
        "\"updated_at\" TEXT".to_string(),
    ]
}

/// DDL for a user table: system columns followed by user columns
pub fn create_table_sql(table: &str, columns: &[Column]) -> String {
    let mut defs = system_column_defs();
    defs.extend(columns.iter().map(Column::definition_sql));
    format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
}

/// Complete table state tracked in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub columns: Vec<Column>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        SYSTEM_COLUMNS.contains(&name) || self.column(name).is_some()
    }
}

/// Map of a branch's schema as of a point in its change history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableDef>,
    pub views: BTreeMap<String, String>,
    pub indexes: BTreeMap<String, IndexDef>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a snapshot by replaying changes in order.
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Result<Self> {
        let mut snapshot = Self::new();
        for change in changes {
            snapshot.apply_change(change)?;
        }
        Ok(snapshot)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Indexes defined on a table
    pub fn indexes_for(&self, table: &str) -> Vec<&IndexDef> {
        self.indexes.values().filter(|i| i.table == table).collect()
    }

    fn details<'a>(change: &'a Change) -> Result<&'a serde_json::Value> {
        change.details.as_ref().ok_or_else(|| {
            Error::SchemaError {
                change_id: change.id.clone(),
                tenant: String::new(),
                message: format!("{} change has no details", change.change_type.as_str()),
            }
        })
    }

    fn detail_str<'a>(change: &'a Change, key: &str) -> Result<&'a str> {
        Self::details(change)?
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::SchemaError {
                change_id: change.id.clone(),
                tenant: String::new(),
                message: format!("missing '{key}' in change details"),
            })
    }

    /// Replay one change into the snapshot, validating it is legal
    /// against the current state.
    pub fn apply_change(&mut self, change: &Change) -> Result<()> {
        match change.change_type {
            ChangeType::CreateTable => {
                let table = change.entity_name.clone();
                if self.has_table(&table) {
                    return Err(Error::AlreadyExists(format!("table '{table}'")));
                }
                let columns: Vec<Column> =
                    serde_json::from_value(Self::details(change)?["columns"].clone())?;
                self.tables.insert(table, TableDef { columns });
            }
            ChangeType::DropTable => {
                let table = &change.entity_name;
                if self.tables.remove(table).is_none() {
                    return Err(Error::NotFound(format!("table '{table}'")));
                }
                self.indexes.retain(|_, idx| idx.table != *table);
            }
            ChangeType::RenameTable => {
                let old = &change.entity_name;
                let new = Self::detail_str(change, "new_name")?.to_string();
                if self.has_table(&new) {
                    return Err(Error::AlreadyExists(format!("table '{new}'")));
                }
                let def = self
                    .tables
                    .remove(old)
                    .ok_or_else(|| Error::NotFound(format!("table '{old}'")))?;
                self.tables.insert(new.clone(), def);
                for idx in self.indexes.values_mut() {
                    if idx.table == *old {
                        idx.table = new.clone();
                    }
                }
            }
            ChangeType::AddColumn => {
                let table = Self::detail_str(change, "table")?.to_string();
                let column: Column =
                    serde_json::from_value(Self::details(change)?["column"].clone())?;
                let def = self
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
                if def.has_column(&column.name) {
                    return Err(Error::AlreadyExists(format!(
                        "column '{}' on table '{table}'",
                        column.name
                    )));
                }
                def.columns.push(column);
            }
            ChangeType::DropColumn => {
                let table = Self::detail_str(change, "table")?.to_string();
                let column = Self::detail_str(change, "column")?.to_string();
                let def = self
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
                let before = def.columns.len();
                def.columns.retain(|c| c.name != column);
                if def.columns.len() == before {
                    return Err(Error::NotFound(format!(
                        "column '{column}' on table '{table}'"
                    )));
                }
                self.indexes
                    .retain(|_, idx| !(idx.table == table && idx.columns.contains(&column)));
            }
            ChangeType::RenameColumn => {
                let table = Self::detail_str(change, "table")?.to_string();
                let old = Self::detail_str(change, "old")?.to_string();
                let new = Self::detail_str(change, "new")?.to_string();
                let def = self
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
                if def.has_column(&new) {
                    return Err(Error::AlreadyExists(format!(
                        "column '{new}' on table '{table}'"
                    )));
                }
                let col = def
                    .columns
                    .iter_mut()
                    .find(|c| c.name == old)
                    .ok_or_else(|| Error::NotFound(format!("column '{old}' on table '{table}'")))?;
                col.name = new.clone();
                for idx in self.indexes.values_mut() {
                    if idx.table == table {
                        for c in idx.columns.iter_mut() {
                            if *c == old {
                                *c = new.clone();
                            }
                        }
                    }
                }
            }
            ChangeType::CreateView => {
                let view = change.entity_name.clone();
                if self.views.contains_key(&view) {
                    return Err(Error::AlreadyExists(format!("view '{view}'")));
                }
                let select = Self::detail_str(change, "select")?.to_string();
                self.views.insert(view, select);
            }
            ChangeType::UpdateView => {
                let view = change.entity_name.clone();
                if !self.views.contains_key(&view) {
                    return Err(Error::NotFound(format!("view '{view}'")));
                }
                let select = Self::detail_str(change, "select")?.to_string();
                self.views.insert(view, select);
            }
            ChangeType::DropView => {
                let view = &change.entity_name;
                if self.views.remove(view).is_none() {
                    return Err(Error::NotFound(format!("view '{view}'")));
                }
            }
            ChangeType::CreateIndex => {
                let name = change.entity_name.clone();
                if self.indexes.contains_key(&name) {
                    return Err(Error::AlreadyExists(format!("index '{name}'")));
                }
                let details = Self::details(change)?;
                let index: IndexDef = serde_json::from_value(details.clone())?;
                if !self.has_table(&index.table) {
                    return Err(Error::NotFound(format!("table '{}'", index.table)));
                }
                self.indexes.insert(name, index);
            }
            ChangeType::DropIndex => {
                let name = &change.entity_name;
                if self.indexes.remove(name).is_none() {
                    return Err(Error::NotFound(format!("index '{name}'")));
                }
            }
        }
        Ok(())
    }
}

/// Shared plumbing for the table/column/view/index managers: branch
/// resolution, snapshot construction, and the emit-then-apply step
/// every schema operation ends with.
#[derive(Debug, Clone)]
pub(crate) struct SchemaOps {
    pub ctx: std::sync::Arc<crate::engine::EngineCtx>,
    pub database: String,
    pub branch: String,
    pub database_id: String,
    pub branch_id: String,
}

impl SchemaOps {
    pub fn resolve(
        ctx: std::sync::Arc<crate::engine::EngineCtx>,
        database: &str,
        branch: &str,
    ) -> Result<Self> {
        let (database_id, branch_id) = {
            let conn = ctx.meta.conn();
            let db = crate::branch::resolve_database(&conn, database)?;
            let br = crate::branch::resolve_branch(&conn, &db, branch)?;
            (db.id, br.id)
        };
        Ok(Self {
            ctx,
            database: database.to_string(),
            branch: branch.to_string(),
            database_id,
            branch_id,
        })
    }

    /// Snapshot of the branch schema including not-yet-applied
    /// changes, which is the state new operations validate against.
    pub fn snapshot(&self) -> Result<SchemaSnapshot> {
        let changes = {
            let conn = self.ctx.meta.conn();
            Change::list_for_branch(&conn, &self.branch_id)?
        };
        SchemaSnapshot::from_changes(changes.iter())
    }

    pub fn check_maintenance(&self) -> Result<()> {
        let conn = self.ctx.meta.conn();
        crate::maintenance::check(&conn, &self.branch_id, &self.branch)
    }

    /// Record the change and fan it out to every materialized tenant.
    /// On failure the change stays linked with `applied = false`, so
    /// a later apply retries it.
    pub fn emit(&self, change: &mut Change) -> Result<()> {
        let tracker =
            crate::changes::tracker::ChangeTracker::new(self.ctx.clone(), &self.branch_id);
        tracker.append(change)?;
        let applier = crate::changes::applier::ChangeApplier::new(
            self.ctx.clone(),
            &self.database,
            &self.branch,
            &self.branch_id,
        );
        applier.apply_unapplied()?;
        change.applied = true;
        Ok(())
    }

    pub fn new_change(
        &self,
        change_type: ChangeType,
        entity_type: crate::changes::EntityType,
        entity_name: &str,
    ) -> Change {
        Change::new(
            &self.database_id,
            &self.branch_id,
            change_type,
            entity_type,
            entity_name,
        )
    }
}
