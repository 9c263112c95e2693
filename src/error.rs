//! Error types for the daemon core.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the daemon core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// No entity with the given id or prefix.
    #[error("no such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An id prefix matched more than one stored id.
    #[error("identifier prefix '{0}' matches more than one id")]
    AmbiguousPrefix(String),

    // =========================================================================
    // Reservation Errors
    // =========================================================================
    /// A name is already reserved for a different id.
    #[error("name '{name}' is already reserved for id {id}")]
    AlreadyReserved { name: String, id: String },

    /// A new id shares its minimum unambiguous prefix with a stored id.
    #[error("id '{0}' collides with an existing id")]
    IdCollision(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Malformed spec, annotation, enum value, or empty required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the entity's current state.
    #[error("{kind} '{id}' is in state '{state}', cannot {op}")]
    FailedPrecondition {
        kind: &'static str,
        id: String,
        state: String,
        op: &'static str,
    },

    // =========================================================================
    // Deadline Errors
    // =========================================================================
    /// An exec inside a container exceeded its own deadline.
    #[error("exec in container '{id}' timed out after {timeout:?}")]
    ExecTimeout { id: String, timeout: Duration },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // External Process Errors
    // =========================================================================
    /// The OCI runtime or the namespace helper exited non-zero.
    #[error("{binary} {op} failed for '{id}': {stderr}")]
    RuntimeFailed {
        binary: String,
        op: &'static str,
        id: String,
        stderr: String,
    },

    /// A pinned namespace path failed verification or cleanup.
    #[error("namespace path {path}: {reason}")]
    Namespace { path: PathBuf, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sentinel for on-disk entities owned by another container manager.
    /// Rehydration skips these without treating them as failures.
    #[error("directory is not managed by this daemon")]
    NonManagedEntity,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing entity of the given kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True if this error is the non-managed rehydration sentinel.
    pub fn is_non_managed(&self) -> bool {
        matches!(self, Error::NonManagedEntity)
    }
}
