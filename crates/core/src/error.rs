//! Error model for the unit of work and the persistence ports it drives.

use thiserror::Error;

/// Result type used across the ORM layer.
pub type OrmResult<T> = Result<T, OrmError>;

/// Failure reported by a persistence port (data mapper, connection, id generator).
///
/// This is the error surface the unit of work consumes. Adapters map their driver
/// errors into it; anything without a better home goes through `Backend`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The addressed row/record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write collided with existing state (duplicate key, stale row, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transaction control failed (begin/commit/rollback, poisoned locks).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Entity (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// ORM-level error.
///
/// ## Propagation
///
/// - `NoIdAccessor` / `NotTracked` surface immediately from the registry and change
///   tracker (the only exception is `EntityRegistry::is_registered`, which reports `false`).
/// - Anything raised while a commit's transaction is open is wrapped in `CommitFailed`,
///   after the transaction was rolled back and inserted ids were reset.
#[derive(Debug, Error)]
pub enum OrmError {
    /// No identity getter/setter registered for the entity type.
    #[error("no id accessor registered for `{0}`")]
    NoIdAccessor(String),

    /// The change tracker has no baseline for this entity instance.
    #[error("entity of type `{0}` is not being tracked")]
    NotTracked(String),

    /// `commit()` called before a transactional connection was configured.
    #[error("no connection configured for the unit of work")]
    NoConnection,

    /// No data mapper registered for the entity type.
    #[error("no data mapper registered for `{0}`")]
    NoDataMapper(String),

    /// Two Rust types were registered under the same entity type name.
    #[error("entity type name `{0}` resolves to a different Rust type")]
    TypeMismatch(String),

    /// Capturing or comparing an entity snapshot failed.
    #[error("snapshot of `{type_name}` failed: {message}")]
    Snapshot { type_name: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The commit aborted; the transaction has already been rolled back.
    #[error("commit failed: {source}")]
    CommitFailed {
        #[source]
        source: Box<OrmError>,
    },

    /// The transaction committed but a mapper's post-commit hook failed.
    #[error("post-commit hook of `{type_name}` failed: {source}")]
    PostCommit {
        type_name: String,
        #[source]
        source: StorageError,
    },
}

impl OrmError {
    pub fn commit_failed(cause: OrmError) -> Self {
        Self::CommitFailed {
            source: Box::new(cause),
        }
    }

    /// The original cause of a failed commit, if this is one.
    pub fn commit_cause(&self) -> Option<&OrmError> {
        match self {
            OrmError::CommitFailed { source } => Some(source),
            _ => None,
        }
    }
}
