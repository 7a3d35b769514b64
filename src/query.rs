// src/query.rs

//! Safe SQL executor for tenant data.
//!
//! Only `SELECT`, `INSERT`, `UPDATE`, and `DELETE` are accepted; DDL
//! and administrative statements are rejected before execution, as
//! are multi-statement strings unless the caller opts in. Reads
//! route to the tenant's read path (`__empty__` for lazy tenants);
//! writes route to the write path, materializing the tenant first.

use crate::config::MAIN;
use crate::connection;
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::metadata::models::{new_id, now_utc};
use crate::schema::{is_system_table, quote_ident};
use crate::tenant::TenantManager;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::warn;

/// Value substituted for masked columns in query results
pub const REDACTED_VALUE: &str = "[redacted]";

/// Operations the executor accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
}

const RESTRICTED_OPERATIONS: [&str; 13] = [
    "CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME", "GRANT", "REVOKE", "VACUUM", "ATTACH",
    "DETACH", "PRAGMA", "REINDEX", "SAVEPOINT",
];

/// Strip comments and collapse whitespace for classification
fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c2 in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
                out.push(' ');
            }
            c if c.is_whitespace() => out.push(' '),
            c => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classify a statement, rejecting anything outside the allowed set.
pub fn classify_sql(sql: &str, allow_multiple_statements: bool) -> Result<SqlOperation> {
    let normalized = normalize_sql(sql);
    if normalized.is_empty() {
        return Err(Error::SqlValidation("query cannot be empty".into()));
    }
    let upper = normalized.to_ascii_uppercase();

    if !allow_multiple_statements {
        if let Some(pos) = upper.find(';') {
            if !upper[pos + 1..].trim().is_empty() {
                return Err(Error::SqlValidation(
                    "multiple statements are not allowed; execute one query at a time".into(),
                ));
            }
        }
    }

    let first_word = upper
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches(';');

    let operation = match first_word {
        "SELECT" => Some(SqlOperation::Select),
        "INSERT" => Some(SqlOperation::Insert),
        "UPDATE" => Some(SqlOperation::Update),
        "DELETE" => Some(SqlOperation::Delete),
        _ => None,
    };

    if let Some(operation) = operation {
        if matches!(operation, SqlOperation::Update | SqlOperation::Delete)
            && !upper.contains("WHERE")
        {
            warn!("{first_word} statement without WHERE clause");
        }
        return Ok(operation);
    }

    for restricted in RESTRICTED_OPERATIONS {
        if first_word == restricted {
            return Err(Error::SqlValidation(format!(
                "{restricted} operations are not allowed; only SELECT, INSERT, UPDATE, and DELETE are permitted"
            )));
        }
    }

    if first_word == "WITH" {
        for restricted in RESTRICTED_OPERATIONS {
            if upper.contains(restricted) {
                return Err(Error::SqlValidation(format!(
                    "WITH clause containing {restricted} operations is not allowed"
                )));
            }
        }
        for (keyword, operation) in [
            ("INSERT", SqlOperation::Insert),
            ("UPDATE", SqlOperation::Update),
            ("DELETE", SqlOperation::Delete),
        ] {
            if upper.contains(keyword) {
                return Ok(operation);
            }
        }
        return Ok(SqlOperation::Select);
    }

    Err(Error::SqlValidation(
        "unrecognized or restricted SQL operation; only SELECT, INSERT, UPDATE, and DELETE are permitted"
            .into(),
    ))
}

fn json_to_sql(value: &JsonValue) -> Result<SqlValue> {
    match value {
        JsonValue::Null => Ok(SqlValue::Null),
        JsonValue::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(Error::SqlValidation(format!("unbindable number {n}")))
            }
        }
        JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(Error::SqlValidation(format!(
            "cannot bind structured value {other} as a parameter"
        ))),
    }
}

fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> JsonValue {
    match value {
        rusqlite::types::ValueRef::Null => JsonValue::Null,
        rusqlite::types::ValueRef::Integer(i) => JsonValue::from(i),
        rusqlite::types::ValueRef::Real(f) => JsonValue::from(f),
        rusqlite::types::ValueRef::Text(t) => {
            JsonValue::String(String::from_utf8_lossy(t).into_owned())
        }
        rusqlite::types::ValueRef::Blob(b) => JsonValue::String(hex::encode(b)),
    }
}

/// One result row
pub type QueryRow = Map<String, JsonValue>;

/// Rows plus affected-row count for writes
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    pub rows_affected: usize,
}

#[derive(Debug, Clone)]
pub struct QueryManager {
    ctx: Arc<EngineCtx>,
    database: String,
    branch: String,
    tenant: String,
}

impl QueryManager {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str, branch: &str, tenant: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
            branch: branch.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Manager for the default tenant
    pub(crate) fn for_main(ctx: Arc<EngineCtx>, database: &str, branch: &str) -> Self {
        Self::new(ctx, database, branch, MAIN)
    }

    fn tenants(&self) -> TenantManager {
        TenantManager::new(self.ctx.clone(), &self.database, &self.branch)
    }

    /// Execute a validated query with no masking
    pub fn query(&self, sql: &str, params: &[JsonValue]) -> Result<QueryResult> {
        self.query_with_options(sql, params, &[], false)
    }

    /// Execute a validated query, optionally masking named result
    /// columns and/or allowing multiple statements.
    pub fn query_with_options(
        &self,
        sql: &str,
        params: &[JsonValue],
        mask_columns: &[&str],
        allow_multiple_statements: bool,
    ) -> Result<QueryResult> {
        let operation = classify_sql(sql, allow_multiple_statements)?;

        // A batch must be classified statement by statement: routing
        // off the leading statement alone would send a script like
        // "SELECT 1; DELETE FROM t" down the read path, and for a
        // lazy tenant the read path is the branch's shared template.
        let normalized = normalize_sql(sql);
        let statements: Vec<&str> = normalized
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let is_batch = statements.len() > 1;
        let mut is_write = operation != SqlOperation::Select;
        if is_batch {
            for statement in &statements {
                if classify_sql(statement, false)? != SqlOperation::Select {
                    is_write = true;
                }
            }
        }

        let tenants = self.tenants();
        let path = if is_write {
            tenants.get_path_for_write(&self.tenant)?
        } else {
            tenants.get_path_for_read(&self.tenant)?
        };
        let tenant_id = tenants.tenant_id(&self.tenant)?;

        let encryption = self.ctx.encryption();
        let conn = connection::open_tenant(&path, &tenant_id, encryption.as_ref())?;

        let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect::<Result<_>>()?;

        // A multi-statement script can only run as a batch; rusqlite
        // binds parameters per statement, so none are accepted here.
        if is_batch {
            if !bound.is_empty() {
                return Err(Error::SqlValidation(
                    "parameters are not supported with multiple statements".into(),
                ));
            }
            conn.execute_batch(sql)?;
            return Ok(QueryResult::default());
        }

        if is_write {
            let rows_affected = conn.execute(sql, rusqlite::params_from_iter(bound))?;
            return Ok(QueryResult {
                rows: Vec::new(),
                rows_affected,
            });
        }

        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows_iter = stmt.query(rusqlite::params_from_iter(bound))?;

        let mut rows = Vec::new();
        while let Some(row) = rows_iter.next()? {
            let mut out = QueryRow::new();
            for (i, name) in column_names.iter().enumerate() {
                let mut value = sql_to_json(row.get_ref(i)?);
                if !value.is_null() && mask_columns.contains(&name.as_str()) {
                    value = JsonValue::String(REDACTED_VALUE.to_string());
                }
                out.insert(name.clone(), value);
            }
            rows.push(out);
        }

        Ok(QueryResult {
            rows,
            rows_affected: 0,
        })
    }

    fn check_user_table(&self, table: &str) -> Result<()> {
        if is_system_table(table) {
            return Err(Error::Protected(format!("table '{table}' is reserved")));
        }
        Ok(())
    }

    /// Insert a row, filling the system columns. Returns the stored
    /// row including its generated id.
    pub fn insert(&self, table: &str, mut values: QueryRow) -> Result<QueryRow> {
        self.check_user_table(table)?;

        values
            .entry("id".to_string())
            .or_insert_with(|| JsonValue::String(new_id()));
        let now = now_utc();
        values
            .entry("created_at".to_string())
            .or_insert_with(|| JsonValue::String(now.clone()));
        values
            .entry("updated_at".to_string())
            .or_insert_with(|| JsonValue::String(now.clone()));

        let columns: Vec<String> = values.keys().cloned().collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );
        let params: Vec<JsonValue> = columns.iter().map(|c| values[c].clone()).collect();

        self.query_with_options(&sql, &params, &[], false)?;
        Ok(values)
    }

    /// Update a row by id, bumping `updated_at`
    pub fn update(&self, table: &str, id: &str, mut values: QueryRow) -> Result<usize> {
        self.check_user_table(table)?;
        values.remove("id");
        values.insert(
            "updated_at".to_string(),
            JsonValue::String(now_utc()),
        );

        let columns: Vec<String> = values.keys().cloned().collect();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" = ?{}",
            quote_ident(table),
            assignments.join(", "),
            columns.len() + 1
        );
        let mut params: Vec<JsonValue> = columns.iter().map(|c| values[c].clone()).collect();
        params.push(JsonValue::String(id.to_string()));

        Ok(self.query_with_options(&sql, &params, &[], false)?.rows_affected)
    }

    /// Delete a row by id
    pub fn delete(&self, table: &str, id: &str) -> Result<usize> {
        self.check_user_table(table)?;
        let sql = format!("DELETE FROM {} WHERE \"id\" = ?1", quote_ident(table));
        let params = [JsonValue::String(id.to_string())];
        Ok(self.query_with_options(&sql, &params, &[], false)?.rows_affected)
    }

    /// Update rows matching a caller-supplied WHERE clause
    pub fn update_where(
        &self,
        table: &str,
        values: QueryRow,
        where_clause: &str,
        params: &[JsonValue],
    ) -> Result<usize> {
        self.check_user_table(table)?;
        let mut values = values;
        values.remove("id");
        values.insert("updated_at".to_string(), JsonValue::String(now_utc()));

        let columns: Vec<String> = values.keys().cloned().collect();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let shifted = shift_placeholders(where_clause, columns.len());
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            shifted
        );
        let mut bound: Vec<JsonValue> = columns.iter().map(|c| values[c].clone()).collect();
        bound.extend(params.iter().cloned());

        Ok(self.query_with_options(&sql, &bound, &[], false)?.rows_affected)
    }

    /// Delete rows matching a caller-supplied WHERE clause
    pub fn delete_where(
        &self,
        table: &str,
        where_clause: &str,
        params: &[JsonValue],
    ) -> Result<usize> {
        self.check_user_table(table)?;
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), where_clause);
        Ok(self.query_with_options(&sql, params, &[], false)?.rows_affected)
    }
}

/// Renumber `?N` placeholders in a WHERE clause so they bind after
/// `offset` SET parameters.
fn shift_placeholders(clause: &str, offset: usize) -> String {
    let mut out = String::with_capacity(clause.len());
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '?' {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            match digits.parse::<usize>() {
                Ok(n) => {
                    out.push('?');
                    out.push_str(&(n + offset).to_string());
                }
                Err(_) => out.push('?'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
