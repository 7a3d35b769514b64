// src/metadata/models.rs

//! Record types for the metadata index.
//!
//! Each struct corresponds to one metadata table and carries its own
//! CRUD methods over a borrowed connection. Change rows live in
//! `src/changes` next to their domain logic.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// RFC 3339 UTC timestamp with microsecond precision; lexicographic
/// order matches chronological order.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh opaque id
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn json_to_text(value: &Option<JsonValue>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn text_to_json(text: Option<String>) -> Option<JsonValue> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

/// A named namespace within a project
#[derive(Debug, Clone)]
pub struct DatabaseRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Option<JsonValue>,
    pub materialized: bool,
    pub created_at: String,
}

impl DatabaseRecord {
    pub fn new(name: &str, description: Option<&str>) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            description: description.map(str::to_string),
            metadata: None,
            materialized: false,
            created_at: now_utc(),
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO databases (id, name, description, metadata, materialized, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.id,
                &self.name,
                &self.description,
                json_to_text(&self.metadata),
                self.materialized as i32,
                &self.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, description, metadata, materialized, created_at
             FROM databases WHERE name = ?1",
        )?;
        let record = stmt.query_row([name], Self::from_row).optional()?;
        Ok(record)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, description, metadata, materialized, created_at
             FROM databases ORDER BY name",
        )?;
        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn mark_materialized(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("UPDATE databases SET materialized = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM databases WHERE id = ?1", [id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            metadata: text_to_json(row.get(3)?),
            materialized: row.get::<_, i32>(4)? != 0,
            created_at: row.get(5)?,
        })
    }
}

/// A named line of schema evolution within a database
#[derive(Debug, Clone)]
pub struct BranchRecord {
    pub id: String,
    pub database_id: String,
    pub name: String,
    pub parent_branch: Option<String>,
    pub schema_version: Option<String>,
    pub materialized: bool,
    pub metadata: Option<JsonValue>,
    pub archived_at: Option<String>,
    pub created_at: String,
}

impl BranchRecord {
    pub fn new(database_id: &str, name: &str, parent_branch: Option<&str>) -> Self {
        Self {
            id: new_id(),
            database_id: database_id.to_string(),
            name: name.to_string(),
            parent_branch: parent_branch.map(str::to_string),
            schema_version: None,
            materialized: false,
            metadata: None,
            archived_at: None,
            created_at: now_utc(),
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO branches
             (id, database_id, name, parent_branch, schema_version, materialized, metadata, archived_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.id,
                &self.database_id,
                &self.name,
                &self.parent_branch,
                &self.schema_version,
                self.materialized as i32,
                json_to_text(&self.metadata),
                &self.archived_at,
                &self.created_at,
            ],
        )?;
        Ok(())
    }

    /// Look up a live (non-archived) branch by name
    pub fn get(conn: &Connection, database_id: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, database_id, name, parent_branch, schema_version, materialized,
                    metadata, archived_at, created_at
             FROM branches WHERE database_id = ?1 AND name = ?2 AND archived_at IS NULL",
        )?;
        let record = stmt
            .query_row(params![database_id, name], Self::from_row)
            .optional()?;
        Ok(record)
    }

    /// List live branches of a database
    pub fn list(conn: &Connection, database_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, database_id, name, parent_branch, schema_version, materialized,
                    metadata, archived_at, created_at
             FROM branches WHERE database_id = ?1 AND archived_at IS NULL ORDER BY name",
        )?;
        let records = stmt
            .query_map([database_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// List every branch row including archived ones
    pub fn list_all(conn: &Connection, database_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, database_id, name, parent_branch, schema_version, materialized,
                    metadata, archived_at, created_at
             FROM branches WHERE database_id = ?1 ORDER BY created_at",
        )?;
        let records = stmt
            .query_map([database_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn mark_materialized(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("UPDATE branches SET materialized = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Archive a branch row; the name becomes reusable immediately
    pub fn archive(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE branches SET archived_at = ?1 WHERE id = ?2",
            params![now_utc(), id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            database_id: row.get(1)?,
            name: row.get(2)?,
            parent_branch: row.get(3)?,
            schema_version: row.get(4)?,
            materialized: row.get::<_, i32>(5)? != 0,
            metadata: text_to_json(row.get(6)?),
            archived_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// An isolated SQLite database carrying its branch's schema
#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub id: String,
    pub branch_id: String,
    pub name: String,
    pub shard: String,
    pub materialized: bool,
    pub metadata: Option<JsonValue>,
    pub created_at: String,
}

impl TenantRecord {
    pub fn new(branch_id: &str, name: &str, shard: &str) -> Self {
        Self {
            id: new_id(),
            branch_id: branch_id.to_string(),
            name: name.to_string(),
            shard: shard.to_string(),
            materialized: false,
            metadata: None,
            created_at: now_utc(),
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO tenants (id, branch_id, name, shard, materialized, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.id,
                &self.branch_id,
                &self.name,
                &self.shard,
                self.materialized as i32,
                json_to_text(&self.metadata),
                &self.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, branch_id: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, branch_id, name, shard, materialized, metadata, created_at
             FROM tenants WHERE branch_id = ?1 AND name = ?2",
        )?;
        let record = stmt
            .query_row(params![branch_id, name], Self::from_row)
            .optional()?;
        Ok(record)
    }

    pub fn list(conn: &Connection, branch_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, branch_id, name, shard, materialized, metadata, created_at
             FROM tenants WHERE branch_id = ?1 ORDER BY name",
        )?;
        let records = stmt
            .query_map([branch_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn list_materialized(conn: &Connection, branch_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, branch_id, name, shard, materialized, metadata, created_at
             FROM tenants WHERE branch_id = ?1 AND materialized = 1 ORDER BY name",
        )?;
        let records = stmt
            .query_map([branch_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn mark_materialized(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("UPDATE tenants SET materialized = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn rename(conn: &Connection, id: &str, new_name: &str, new_shard: &str) -> Result<()> {
        conn.execute(
            "UPDATE tenants SET name = ?1, shard = ?2 WHERE id = ?3",
            params![new_name, new_shard, id],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM tenants WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn delete_for_branch(conn: &Connection, branch_id: &str) -> Result<()> {
        conn.execute("DELETE FROM tenants WHERE branch_id = ?1", [branch_id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            branch_id: row.get(1)?,
            name: row.get(2)?,
            shard: row.get(3)?,
            materialized: row.get::<_, i32>(4)? != 0,
            metadata: text_to_json(row.get(5)?),
            created_at: row.get(6)?,
        })
    }
}
