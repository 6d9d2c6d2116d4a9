//! Database error types shared by both transactional scopes

use crate::error::{AppError, AppErrorKind, InfrastructureError};
use std::fmt;

/// Classified database failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Could not reach the database or acquire a pooled connection
    ConnectionFailed { message: String },
    /// Row expected but not found
    NotFound { entity: String, id: String },
    /// Unique / exclusion constraint violated
    UniqueViolation { constraint: String },
    /// Serialization failure or deadlock; the transaction may be retried
    SerializationFailure { message: String },
    /// Stored value could not be decoded into a domain type
    Decode { message: String },
    /// Commit failed after the transaction body succeeded
    CommitFailed { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            message: message.into(),
        })
    }

    /// Map a sqlx error onto our classification
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionFailed {
                    message: err.to_string(),
                }
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation, exclusion_violation
                Some("23505") | Some("23P01") => DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => DatabaseErrorKind::SerializationFailure {
                    message: db_err.message().to_string(),
                },
                _ => DatabaseErrorKind::Unknown {
                    message: db_err.message().to_string(),
                },
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseErrorKind::Decode {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };

        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionFailed { .. }
                | DatabaseErrorKind::SerializationFailure { .. }
        )
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::ConnectionFailed { message } => {
                write!(f, "database connection failed: {}", message)
            }
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::SerializationFailure { message } => {
                write!(f, "serialization failure: {}", message)
            }
            DatabaseErrorKind::Decode { message } => write!(f, "decode error: {}", message),
            DatabaseErrorKind::CommitFailed { message } => write!(f, "commit failed: {}", message),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            is_retryable: err.is_retryable(),
            message: err.to_string(),
        }))
    }
}

pub type DbResult<T> = Result<T, DatabaseError>;
