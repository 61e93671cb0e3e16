//! Error types for the confsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error (including an unknown conflict strategy).
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// TOML serialization error when saving.
    #[error("configuration serialize error: {0}")]
    SerializeError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading or writing the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from the version-control transport (git2).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The mirror path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Clone of the remote repository failed.
    #[error("clone of '{url}' failed: {detail}")]
    CloneFailed {
        url: String,
        detail: String,
    },

    /// Fetching or merging the remote branch failed.
    #[error("pull from '{remote}/{branch}' failed: {detail}")]
    PullFailed {
        remote: String,
        branch: String,
        detail: String,
    },

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected {
        branch: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from structured parsing inside the merge engine.
///
/// These never cross the engine boundary: a parse failure downgrades the
/// pair to an opaque conflict.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Content on one side is not valid structured data.
    #[error("{side} content of '{path}' is not structured data: {detail}")]
    Unparseable {
        path: String,
        side: &'static str,
        detail: String,
    },

    /// The merged value could not be serialized back to bytes.
    #[error("failed to serialize merged value for '{path}': {detail}")]
    SerializeFailed {
        path: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Backup errors
// ---------------------------------------------------------------------------

/// Errors from snapshot creation, listing, and restore.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The snapshot to restore does not exist.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The snapshot manifest is missing or corrupt.
    #[error("snapshot manifest at '{path}' is invalid: {detail}")]
    InvalidManifest {
        path: String,
        detail: String,
    },

    /// One or more files could not be captured or restored.
    #[error("{failed} file(s) failed during {operation}")]
    PartialFailure {
        operation: &'static str,
        failed: usize,
    },

    /// Generic I/O error.
    #[error("backup I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the pull/push orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another pull/push/sync is already running on this engine.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning {
        started_at: String,
    },

    /// Conflicts were left unresolved and the caller required full resolution.
    #[error("{count} conflict(s) left unresolved")]
    ConflictUnresolved {
        count: usize,
    },

    /// A per-file filesystem error while copying or writing.
    #[error("filesystem error on '{path}': {detail}")]
    Filesystem {
        path: String,
        detail: String,
    },

    /// Configuration failed pre-flight validation.
    #[error("sync config error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Transport failure during a phase.
    #[error("sync transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Safety snapshot could not be taken.
    #[error("sync backup error: {0}")]
    BackupError(#[from] BackupError),
}

impl SyncError {
    /// Build a [`SyncError::Filesystem`] from a path and an I/O error.
    pub fn fs(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            detail: err.to_string(),
        }
    }
}
