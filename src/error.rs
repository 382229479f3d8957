//! Error kinds surfaced by the catalog, document store and broadcaster.
//!
//! Every failure maps to a stable `(kind, message)` pair. The kind is what
//! adapters switch on (HTTP status, CLI exit text); the message is for humans.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A caller-supplied collection or schema name failed sanitisation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Document or schema content does not conform.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Tenant, schema or document does not exist.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },

    #[error("quota exceeded: current {used} bytes, limit {limit} bytes, attempted to add {requested} bytes")]
    QuotaExceeded { used: u64, limit: u64, requested: u64 },

    /// Randomness failure or a uniqueness collision on a generated value.
    /// Callers may retry.
    #[error("generation failure: {0}")]
    GenerationFailure(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Stable, matchable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidIdentifier,
    ValidationFailed,
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    GenerationFailure,
    StorageFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidIdentifier => "invalid_identifier",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::StorageFailure => "storage_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            DbError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            DbError::NotFound { .. } => ErrorKind::NotFound,
            DbError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            DbError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            DbError::GenerationFailure(_) => ErrorKind::GenerationFailure,
            DbError::StorageFailure(_) => ErrorKind::StorageFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::GenerationFailure(_))
    }

    pub(crate) fn tenant_not_found(id: &str) -> Self {
        DbError::NotFound {
            what: "database",
            name: id.to_string(),
        }
    }

    pub(crate) fn schema_not_found(name: &str) -> Self {
        DbError::NotFound {
            what: "schema",
            name: name.to_string(),
        }
    }

    pub(crate) fn document_not_found(id: &str) -> Self {
        DbError::NotFound {
            what: "document",
            name: id.to_string(),
        }
    }
}

impl From<sled::Error> for DbError {
    fn from(err: sled::Error) -> Self {
        DbError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::StorageFailure(format!("serialization: {}", err))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::StorageFailure(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<DbError>> for DbError {
    fn from(err: sled::transaction::TransactionError<DbError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => e.into(),
        }
    }
}
