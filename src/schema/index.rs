// src/schema/index.rs

//! Index operations. Names are auto-generated
//! (`idx_<table>_<col...>`, `uniq_...` for unique indexes) when not
//! supplied, and column existence is checked before any SQL runs.
//! SQLite's own auto-indexes never appear in listings because only
//! engine-created indexes enter the change log.

use crate::changes::{ChangeType, EntityType};
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::schema::table::build_index_def;
use crate::schema::{IndexDef, SchemaOps, quote_ident};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct IndexManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
}

impl IndexManager {
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

    /// Indexes of the branch, optionally filtered to one table
    pub fn list(&self, table: Option<&str>) -> Result<Vec<IndexDef>> {
        let ops = self.ops()?;
        let snapshot = ops.snapshot()?;
        Ok(snapshot
            .indexes
            .into_values()
            .filter(|idx| table.is_none_or(|t| idx.table == t))
            .collect())
    }

    /// Create an index, generating a name when none is given.
    /// Returns the index name.
    pub fn create(
        &self,
        table: &str,
        columns: &[String],
        name: Option<&str>,
        unique: bool,
    ) -> Result<String> {
        let ops = self.ops()?;
        ops.check_maintenance()?;

        let snapshot = ops.snapshot()?;
        let def = snapshot
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;

        let index = build_index_def(table, columns, name, unique, &def.columns)?;
        if snapshot.indexes.contains_key(&index.name) {
            return Err(Error::AlreadyExists(format!("index '{}'", index.name)));
        }

        let mut change = ops.new_change(ChangeType::CreateIndex, EntityType::Index, &index.name);
        change.details = Some(serde_json::to_value(&index)?);
        change.sql = Some(index.create_sql());
        ops.emit(&mut change)?;
        Ok(index.name)
    }

    pub fn drop(&self, name: &str) -> Result<()> {
        let ops = self.ops()?;
        ops.check_maintenance()?;

        if !ops.snapshot()?.indexes.contains_key(name) {
            return Err(Error::NotFound(format!("index '{name}'")));
        }

        let mut change = ops.new_change(ChangeType::DropIndex, EntityType::Index, name);
        change.sql = Some(format!("DROP INDEX {}", quote_ident(name)));
        ops.emit(&mut change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::materialized_ctx;
    use crate::schema::table::TableManager;
    use crate::schema::{Column, ColumnType};

    fn setup() -> (tempfile::TempDir, Arc<EngineCtx>, IndexManager) {
        let (temp, ctx) = materialized_ctx();
        TableManager::new(ctx.clone(), "app", "main")
            .create(
                "users",
                vec![
                    Column::new("email", ColumnType::Text),
                    Column::new("age", ColumnType::Integer),
                ],
                None,
            )
            .unwrap();
        let indexes = IndexManager::new(ctx.clone(), "app", "main");
        (temp, ctx, indexes)
    }

    fn template_has_index(ctx: &EngineCtx, name: &str) -> bool {
        let path = crate::paths::tenant_db_path(&ctx.root, "app", "main", "__empty__");
        let conn = rusqlite::Connection::open(path).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count > 0
    }

    #[test]
    fn test_create_with_generated_names() {
        let (_temp, ctx, indexes) = setup();

        let name = indexes
            .create("users", &["email".to_string()], None, false)
            .unwrap();
        assert_eq!(name, "idx_users_email");
        assert!(template_has_index(&ctx, "idx_users_email"));

        let name = indexes
            .create("users", &["email".to_string(), "age".to_string()], None, true)
            .unwrap();
        assert_eq!(name, "uniq_users_email_age");
    }

    #[test]
    fn test_unknown_column_fails_before_sql() {
        let (_temp, ctx, indexes) = setup();

        let err = indexes
            .create("users", &["ghost".to_string()], None, false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        // Nothing was recorded or applied
        assert!(indexes.list(None).unwrap().is_empty());
        assert!(!template_has_index(&ctx, "idx_users_ghost"));
    }

    #[test]
    fn test_drop_and_list() {
        let (_temp, ctx, indexes) = setup();

        indexes
            .create("users", &["email".to_string()], Some("by_email"), false)
            .unwrap();
        assert_eq!(indexes.list(Some("users")).unwrap().len(), 1);

        indexes.drop("by_email").unwrap();
        assert!(indexes.list(None).unwrap().is_empty());
        assert!(!template_has_index(&ctx, "by_email"));

        assert!(matches!(indexes.drop("by_email"), Err(Error::NotFound(_))));
    }
}
