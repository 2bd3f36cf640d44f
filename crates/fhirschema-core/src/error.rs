//! Core error types.

use crate::model::GraphError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an [`Error`], used by callers to pick an exit status
/// and to decide whether an operation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another process holds the lease, or a bookkeeping row raced.
    ConcurrentUpdate,
    /// Transient infrastructure condition (cannot connect, pool exhausted).
    DatabaseNotReady,
    /// Asynchronous cleanup has not finished yet.
    TablespaceRemovalNotComplete,
    /// An underlying statement failed.
    DataAccess,
    /// A precondition failed; needs operator intervention.
    ValidationFailure,
    /// The object graph was built incorrectly.
    Graph,
    /// Bad configuration or arguments.
    Config,
}

/// Schema deployment errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Lease contention or a control-table race.
    #[error("concurrent update: {0}")]
    ConcurrentUpdate(String),

    /// The database cannot serve requests right now.
    #[error("database not ready: {0}")]
    DatabaseNotReady(String),

    /// Objects still present after a drop; retry later.
    #[error("tablespace removal not complete: {0}")]
    TablespaceRemovalNotComplete(String),

    /// A statement failed.
    #[error("data access error: {message}")]
    DataAccess {
        /// What was being done when the failure happened.
        message: String,
        /// Driver error, when there is one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Insert hit an existing primary or unique key.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),

    /// A migration precondition or a deployment guard failed.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Physical data model construction error.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a data access error without an underlying driver error.
    pub fn data_access(message: impl Into<String>) -> Self {
        Self::DataAccess {
            message: message.into(),
            source: None,
        }
    }

    /// Create a data access error wrapping a driver error.
    pub fn data_access_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::DataAccess {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailure(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConcurrentUpdate(_) => ErrorKind::ConcurrentUpdate,
            Error::DatabaseNotReady(_) => ErrorKind::DatabaseNotReady,
            Error::TablespaceRemovalNotComplete(_) => ErrorKind::TablespaceRemovalNotComplete,
            Error::DataAccess { .. } | Error::UniqueViolation(_) => ErrorKind::DataAccess,
            Error::ValidationFailure(_) => ErrorKind::ValidationFailure,
            Error::Graph(_) => ErrorKind::Graph,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether running the same operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrentUpdate
                | ErrorKind::DatabaseNotReady
                | ErrorKind::TablespaceRemovalNotComplete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::ConcurrentUpdate("lease".into()).is_retryable());
        assert!(Error::DatabaseNotReady("down".into()).is_retryable());
        assert!(Error::TablespaceRemovalNotComplete("ts".into()).is_retryable());
        assert!(!Error::validation("rows present").is_retryable());
        assert!(!Error::data_access("boom").is_retryable());
    }

    #[test]
    fn test_unique_violation_is_data_access() {
        let err = Error::UniqueViolation("CONTROL".into());
        assert_eq!(err.kind(), ErrorKind::DataAccess);
    }

    #[test]
    fn test_error_display() {
        let err = Error::data_access("applying FHIRDATA.PATIENT_RESOURCES");
        assert!(err.to_string().contains("PATIENT_RESOURCES"));
    }
}
