//! Error taxonomy of the ingestion pipeline
//!
//! Errors fall into three scopes:
//!
//! - entity-scoped ([`IngestError::Fetch`], [`IngestError::Parse`], staging and
//!   conversion failures): recorded, and the partition carries on unless the
//!   entity is critical
//! - partition-fatal ([`IngestError::EmptyLoad`],
//!   [`IngestError::ReferentialIntegrity`]): the partition is rolled back and
//!   marked failed
//! - invocation-fatal ([`IngestError::StoreUnavailable`]): nothing else can run

use localedb_common::CommonError;
use thiserror::Error;

/// SQLSTATE raised by PostgreSQL on foreign-key violations
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid partition '{token}': {reason}")]
    InvalidPartition { token: String, reason: String },

    #[error("Failed to fetch {locator} after {attempts} attempt(s): {message}")]
    Fetch {
        locator: String,
        attempts: u32,
        message: String,
    },

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("No rows loaded for {entity}")]
    EmptyLoad { entity: String },

    #[error("Referential integrity violated: {0}")]
    ReferentialIntegrity(String),

    #[error("Warehouse unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Staging failed for {artifact}: {message}")]
    Stage { artifact: String, message: String },

    #[error("Geometry conversion failed: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn invalid_partition(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPartition {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(file: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            file: file.into(),
            message: message.to_string(),
        }
    }

    pub fn stage(artifact: impl Into<String>, message: impl ToString) -> Self {
        Self::Stage {
            artifact: artifact.into(),
            message: message.to_string(),
        }
    }

    pub fn empty_load(entity: impl Into<String>) -> Self {
        Self::EmptyLoad {
            entity: entity.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Errors that abort the partition regardless of entity criticality
    pub fn is_partition_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::EmptyLoad { .. } | IngestError::ReferentialIntegrity(_)
        )
    }

    /// Errors that abort the whole invocation
    pub fn is_invocation_fatal(&self) -> bool {
        matches!(self, IngestError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db)
                if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                IngestError::ReferentialIntegrity(db.message().to_string())
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => IngestError::StoreUnavailable(err.to_string()),
            other => IngestError::Database(other),
        }
    }
}

impl From<CommonError> for IngestError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Config(message) => IngestError::Config(message),
            other => IngestError::Internal(other.to_string()),
        }
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        let file = err
            .position()
            .map(|p| format!("line {}", p.line()))
            .unwrap_or_else(|| "csv input".to_string());
        IngestError::parse(file, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_scopes() {
        assert!(IngestError::empty_load("households").is_partition_fatal());
        assert!(IngestError::ReferentialIntegrity("fk".into()).is_partition_fatal());
        assert!(!IngestError::parse("people.txt", "bad line").is_partition_fatal());
        assert!(IngestError::StoreUnavailable("down".into()).is_invocation_fatal());
        assert!(!IngestError::empty_load("x").is_invocation_fatal());
    }

    #[test]
    fn test_pool_errors_map_to_store_unavailable() {
        let err: IngestError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_invocation_fatal());
        let err: IngestError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, IngestError::Database(_)));
    }

    #[test]
    fn test_display_carries_attempts() {
        let err = IngestError::Fetch {
            locator: "https://example.org/a.zip".into(),
            attempts: 3,
            message: "HTTP 503".into(),
        };
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }
}
