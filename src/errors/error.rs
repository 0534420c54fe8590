use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Conflict error: {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl DbError {
    /// SQLite reports a violated UNIQUE index as a database-level error with
    /// a "UNIQUE constraint failed" message. A violation on the idempotency
    /// index means another submission already claimed the key.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Database(db)) => {
                db.message().contains("UNIQUE constraint failed")
            }
            DbError::Conflict(_) => true,
            _ => false,
        }
    }
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Conflict(s) => DbError::Conflict(s.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, Uuid),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Whether this error is a duplicate idempotency key surfacing as a
    /// storage-level uniqueness violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DomainError::Database(db) if db.is_unique_violation())
    }
}

/// Service-level errors (application specific)
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Sync-specific errors
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("Duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid state for {key}: expected {expected}, record is {actual}")]
    InvalidState {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Sync record not found for key: {0}")]
    RecordNotFound(String),

    #[error("No handler registered for sync type: {0}")]
    NoHandler(String),

    #[error("Retry limit exceeded for key {key}: {retry_count} of {max_retries}")]
    RetryLimitExceeded {
        key: String,
        retry_count: i64,
        max_retries: u32,
    },

    #[error("Sync error: {0}")]
    Other(String),
}

/// Validation errors
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' must be between {min} and {max}")]
    Range {
        field: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format { field: String, reason: String },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn range<T: fmt::Display>(field: &str, min: T, max: T) -> Self {
        Self::Range {
            field: field.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}
