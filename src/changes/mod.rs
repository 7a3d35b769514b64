// src/changes/mod.rs

//! Schema change records and their per-branch ordered history.
//!
//! A `Change` row lives once in the global `changes` table; the
//! `branch_changes` link table attaches it to one or more branches
//! with an `applied_order` rank. The link table is the authoritative
//! source of a branch's schema history — the DDL in any tenant file
//! is derivable by replaying it.

pub mod applier;
pub mod comparator;
pub mod tracker;

use crate::error::Result;
use crate::metadata::models::{new_id, now_utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// The closed set of schema mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    RenameColumn,
    CreateView,
    UpdateView,
    DropView,
    CreateIndex,
    DropIndex,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::CreateTable => "CREATE_TABLE",
            ChangeType::DropTable => "DROP_TABLE",
            ChangeType::RenameTable => "RENAME_TABLE",
            ChangeType::AddColumn => "ADD_COLUMN",
            ChangeType::DropColumn => "DROP_COLUMN",
            ChangeType::RenameColumn => "RENAME_COLUMN",
            ChangeType::CreateView => "CREATE_VIEW",
            ChangeType::UpdateView => "UPDATE_VIEW",
            ChangeType::DropView => "DROP_VIEW",
            ChangeType::CreateIndex => "CREATE_INDEX",
            ChangeType::DropIndex => "DROP_INDEX",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATE_TABLE" => Ok(ChangeType::CreateTable),
            "DROP_TABLE" => Ok(ChangeType::DropTable),
            "RENAME_TABLE" => Ok(ChangeType::RenameTable),
            "ADD_COLUMN" => Ok(ChangeType::AddColumn),
            "DROP_COLUMN" => Ok(ChangeType::DropColumn),
            "RENAME_COLUMN" => Ok(ChangeType::RenameColumn),
            "CREATE_VIEW" => Ok(ChangeType::CreateView),
            "UPDATE_VIEW" => Ok(ChangeType::UpdateView),
            "DROP_VIEW" => Ok(ChangeType::DropView),
            "CREATE_INDEX" => Ok(ChangeType::CreateIndex),
            "DROP_INDEX" => Ok(ChangeType::DropIndex),
            _ => Err(format!("Invalid change type: {}", s)),
        }
    }
}

/// Kind of schema entity a change targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Table,
    Column,
    View,
    Index,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Table => "table",
            EntityType::Column => "column",
            EntityType::View => "view",
            EntityType::Index => "index",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "table" => Ok(EntityType::Table),
            "column" => Ok(EntityType::Column),
            "view" => Ok(EntityType::View),
            "index" => Ok(EntityType::Index),
            _ => Err(format!("Invalid entity type: {}", s)),
        }
    }
}

/// One recorded schema mutation.
///
/// Column-level changes use `<table>.<column>` as the entity name so
/// conflict detection can compare at column granularity. The link
/// fields (`applied`, `applied_order`, `copied_from_branch_id`) are
/// populated when the change is loaded through a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub database_id: String,
    pub origin_branch_id: String,
    pub change_type: ChangeType,
    pub entity_type: EntityType,
    pub entity_name: String,
    pub details: Option<JsonValue>,
    pub sql: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub applied_order: i64,
    #[serde(default)]
    pub copied_from_branch_id: Option<String>,
}

impl Change {
    pub fn new(
        database_id: &str,
        origin_branch_id: &str,
        change_type: ChangeType,
        entity_type: EntityType,
        entity_name: &str,
    ) -> Self {
        Self {
            id: new_id(),
            database_id: database_id.to_string(),
            origin_branch_id: origin_branch_id.to_string(),
            change_type,
            entity_type,
            entity_name: entity_name.to_string(),
            details: None,
            sql: None,
            created_at: now_utc(),
            applied: false,
            applied_order: 0,
            copied_from_branch_id: None,
        }
    }

    /// Insert the global change row (no branch link yet)
    pub(crate) fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO changes
             (id, database_id, origin_branch_id, type, entity_type, entity_name, details, sql, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.id,
                &self.database_id,
                &self.origin_branch_id,
                self.change_type.as_str(),
                self.entity_type.as_str(),
                &self.entity_name,
                self.details.as_ref().map(|d| d.to_string()),
                &self.sql,
                &self.created_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a bare change row by id (link fields defaulted)
    pub(crate) fn get(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, database_id, origin_branch_id, type, entity_type, entity_name,
                    details, sql, created_at
             FROM changes WHERE id = ?1",
        )?;
        let change = stmt.query_row([id], Self::from_bare_row).optional()?;
        Ok(change)
    }

    /// Attach a change to a branch at an explicit order
    pub(crate) fn link(
        conn: &Connection,
        branch_id: &str,
        change_id: &str,
        applied: bool,
        applied_order: i64,
        copied_from_branch_id: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO branch_changes
             (branch_id, change_id, applied, applied_order, copied_from_branch_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                branch_id,
                change_id,
                applied as i32,
                applied_order,
                copied_from_branch_id,
            ],
        )?;
        Ok(())
    }

    /// Next `applied_order` rank for a branch (starts at 1)
    pub(crate) fn next_order(conn: &Connection, branch_id: &str) -> Result<i64> {
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(applied_order), 0) FROM branch_changes WHERE branch_id = ?1",
            [branch_id],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    /// Ordered change history of a branch
    pub(crate) fn list_for_branch(conn: &Connection, branch_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT c.id, c.database_id, c.origin_branch_id, c.type, c.entity_type,
                    c.entity_name, c.details, c.sql, c.created_at,
                    bc.applied, bc.applied_order, bc.copied_from_branch_id
             FROM branch_changes bc
             JOIN changes c ON c.id = bc.change_id
             WHERE bc.branch_id = ?1
             ORDER BY bc.applied_order",
        )?;
        let changes = stmt
            .query_map([branch_id], Self::from_linked_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    pub(crate) fn mark_applied(conn: &Connection, branch_id: &str, change_id: &str) -> Result<()> {
        conn.execute(
            "UPDATE branch_changes SET applied = 1 WHERE branch_id = ?1 AND change_id = ?2",
            params![branch_id, change_id],
        )?;
        Ok(())
    }

    /// Remove one link row; the global change row stays because other
    /// branches may reference it. Returns whether a row was removed.
    pub(crate) fn unlink(conn: &Connection, branch_id: &str, change_id: &str) -> Result<bool> {
        let n = conn.execute(
            "DELETE FROM branch_changes WHERE branch_id = ?1 AND change_id = ?2",
            params![branch_id, change_id],
        )?;
        Ok(n > 0)
    }

    /// Remove all link rows for a branch
    pub(crate) fn clear_links(conn: &Connection, branch_id: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM branch_changes WHERE branch_id = ?1",
            [branch_id],
        )?;
        Ok(())
    }

    /// Copy every link row from one branch to another, preserving
    /// order and applied status and stamping the source branch.
    pub(crate) fn copy_links(
        conn: &Connection,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<usize> {
        let n = conn.execute(
            "INSERT INTO branch_changes
             (branch_id, change_id, applied, applied_order, copied_from_branch_id)
             SELECT ?2, change_id, applied, applied_order, ?1
             FROM branch_changes WHERE branch_id = ?1",
            params![source_branch_id, target_branch_id],
        )?;
        Ok(n)
    }

    fn from_bare_row(row: &Row) -> rusqlite::Result<Self> {
        let mut change = Self::parse_common(row)?;
        change.applied = false;
        change.applied_order = 0;
        change.copied_from_branch_id = None;
        Ok(change)
    }

    fn from_linked_row(row: &Row) -> rusqlite::Result<Self> {
        let mut change = Self::parse_common(row)?;
        change.applied = row.get::<_, i32>(9)? != 0;
        change.applied_order = row.get(10)?;
        change.copied_from_branch_id = row.get(11)?;
        Ok(change)
    }

    fn parse_common(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get(3)?;
        let change_type = type_str.parse::<ChangeType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let entity_str: String = row.get(4)?;
        let entity_type = entity_str.parse::<EntityType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let details: Option<String> = row.get(6)?;

        Ok(Self {
            id: row.get(0)?,
            database_id: row.get(1)?,
            origin_branch_id: row.get(2)?,
            change_type,
            entity_type,
            entity_name: row.get(5)?,
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            sql: row.get(7)?,
            created_at: row.get(8)?,
            applied: false,
            applied_order: 0,
            copied_from_branch_id: None,
        })
    }
}
