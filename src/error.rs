// src/error.rs

use thiserror::Error;

/// Core error types for CinchDB
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Name failed validation
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation targets a protected entity (`main`, `__empty__`, system tables)
    #[error("Protected entity: {0}")]
    Protected(String),

    /// Branch is locked by an in-flight apply or merge
    #[error("Branch '{branch}' is in maintenance mode: {reason}")]
    MaintenanceInProgress { branch: String, reason: String },

    /// Merge cannot proceed because both branches touched the same entities
    #[error("Merge conflict: {}", conflicts.join("; "))]
    MergeConflict { conflicts: Vec<String> },

    /// Merge refused by policy (non-fast-forward into main without force)
    #[error("Merge refused: {0}")]
    MergeRefused(String),

    /// A schema change failed while being applied to a tenant
    #[error("Change {change_id} failed on tenant '{tenant}': {message}")]
    SchemaError {
        change_id: String,
        tenant: String,
        message: String,
    },

    /// User-supplied SQL was rejected by the safe executor
    #[error("SQL validation failed: {0}")]
    SqlValidation(String),

    /// Encryption provider failed to apply or rotate a key
    #[error("Encryption error: {0}")]
    Encryption(String),
}

/// Result type alias using CinchDB's Error type
pub type Result<T> = std::result::Result<T, Error>;
