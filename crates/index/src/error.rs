//! Error types for the index write engine.
//!
//! Every fatal outcome of a top-level operation (`commit`, `create`, `clear`,
//! `update_settings`) surfaces as a single [`IndexError`]. Transport problems
//! are grouped under [`BackendError`] so callers can tell a flaky cluster
//! apart from a write that was rejected on its merits.
//!
//! Breaking mapping changes are deliberately absent from this module: they
//! are reported as [`MigrationOutcome::Incompatible`](crate::admin::MigrationOutcome)
//! values, never raised.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// The primary error type for all index operations.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The backend could not be reached or answered with a transport failure.
    #[error(transparent)]
    BackendUnavailable(#[from] BackendError),

    /// Version conflicts persisted after the retry budget was spent.
    #[error(
        "bulk {operation} on '{doc_type}' still had {conflicts} version conflicts after {attempts} attempts"
    )]
    ConflictExceeded {
        doc_type: String,
        operation: String,
        attempts: u32,
        conflicts: u64,
    },

    /// A settings update named keys that cannot be changed on a live index.
    #[error("settings {keys:?} are not dynamically updateable")]
    SettingsRejected { keys: Vec<String> },

    /// A document-level write failed for a reason other than a version conflict.
    #[error("indexing failed in '{index}': {}", failures.join("; "))]
    IndexingFailure { index: String, failures: Vec<String> },

    /// The backend answered an admin request without acknowledging it.
    #[error("{operation} was not acknowledged for index '{index}'")]
    Unacknowledged { operation: String, index: String },

    /// The document type is not registered with the index.
    #[error("unknown document type: {doc_type}")]
    UnknownType { doc_type: String },

    /// A bulk update referenced a script the document type does not declare.
    #[error("unknown script '{script}' for document type '{doc_type}'")]
    UnknownScript { doc_type: String, script: String },

    /// A schema descriptor violates a mapping derivation rule.
    #[error("invalid schema for '{doc_type}': {message}")]
    InvalidSchema { doc_type: String, message: String },
}

/// Errors originating from the search backend transport.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Cluster health did not reach the requested status before the deadline.
    #[error("cluster health did not reach {status} for {indices:?} after {elapsed_ms}ms")]
    ReadinessTimeout {
        indices: Vec<String>,
        status: String,
        elapsed_ms: u64,
    },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl IndexError {
    /// Returns true if the error was caused by the transport rather than the request.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, IndexError::BackendUnavailable(_))
    }
}

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::BackendUnavailable(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::BackendUnavailable(BackendError::Internal {
            backend_name: "worker".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}
