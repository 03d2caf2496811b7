//! Error types for mooring-core

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using mooring-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mooring-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity or operation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Row belongs to another client
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity type outside the supported set
    #[error("Unsupported entity type: {0}")]
    UnsupportedEntity(String),

    /// Execution-time budget exhausted; the transaction was rolled back
    #[error("Query exceeded its {}ms execution budget", .0.as_millis())]
    Timeout(Duration),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable code for this error, used on the wire and in operation records.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) | Self::Serialization(_) => ErrorCode::InvalidInput,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::UnsupportedEntity(_) => ErrorCode::UnsupportedEntity,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Error taxonomy shared by structured results and hard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    VersionConflict,
    OperationConflict,
    AlreadyProcessed,
    ConflictUnresolved,
    Forbidden,
    UnsupportedEntity,
    Timeout,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::OperationConflict => "OPERATION_CONFLICT",
            Self::AlreadyProcessed => "ALREADY_PROCESSED",
            Self::ConflictUnresolved => "CONFLICT_UNRESOLVED",
            Self::Forbidden => "FORBIDDEN",
            Self::UnsupportedEntity => "UNSUPPORTED_ENTITY",
            Self::Timeout => "TIMEOUT",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ConflictUnresolved).unwrap();
        assert_eq!(json, "\"CONFLICT_UNRESOLVED\"");
        assert_eq!(ErrorCode::VersionConflict.to_string(), "VERSION_CONFLICT");
    }

    #[test]
    fn errors_map_to_taxonomy() {
        assert_eq!(
            Error::UnsupportedEntity("widgets".into()).code(),
            ErrorCode::UnsupportedEntity
        );
        assert_eq!(
            Error::Timeout(Duration::from_millis(10)).code(),
            ErrorCode::Timeout
        );
        assert_eq!(Error::Database("boom".into()).code(), ErrorCode::Internal);
    }
}
