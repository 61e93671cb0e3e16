//! Domain model types shared by the merge engine, the resolution policy and
//! the sync engine.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// File record
// ---------------------------------------------------------------------------

/// One side's copy of a file during a single sync pass.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Relative, `/`-separated path.
    pub path: String,
    /// Raw bytes.
    pub content: Vec<u8>,
    /// Last-modified time as observed on disk, when available.
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Read `root/rel_path` from disk.
    pub fn read(root: &Path, rel_path: &str) -> std::io::Result<Self> {
        let full = root.join(rel_path);
        let content = std::fs::read(&full)?;
        let modified_at = std::fs::metadata(&full)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Self {
            path: rel_path.to_string(),
            content,
            modified_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Conflict record
// ---------------------------------------------------------------------------

/// Which copy of a file a decision refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A file that exists on both sides with differing content.
///
/// The replacement content is only reachable through [`ConflictRecord::resolve`],
/// so a record reports `is_resolved() == true` exactly when it carries content
/// to materialize.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub id: String,
    pub path: String,
    pub local_content: Vec<u8>,
    pub remote_content: Vec<u8>,
    /// Content at the last common sync point, if known.
    pub base_content: Option<Vec<u8>>,
    pub local_modified_at: Option<DateTime<Utc>>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    /// Dot-paths the structured merge could not settle (`$` for opaque files).
    pub conflicting_keys: Vec<String>,
    resolution: Option<Vec<u8>>,
}

impl ConflictRecord {
    /// Build an unresolved record from the two sides of a file.
    pub fn new(local: FileRecord, remote: FileRecord, base_content: Option<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: local.path,
            local_content: local.content,
            remote_content: remote.content,
            base_content,
            local_modified_at: local.modified_at,
            remote_modified_at: remote.modified_at,
            conflicting_keys: Vec::new(),
            resolution: None,
        }
    }

    /// Mark the record resolved with the given replacement content.
    pub fn resolve(&mut self, content: Vec<u8>) {
        self.resolution = Some(content);
    }

    /// Clear any resolution (explicit skip).
    pub fn skip(&mut self) {
        self.resolution = None;
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// The replacement content, present iff the record is resolved.
    pub fn resolution(&self) -> Option<&[u8]> {
        self.resolution.as_deref()
    }

    /// Whether applying the resolution would change the local file.
    pub fn changes_local(&self) -> bool {
        self.resolution
            .as_deref()
            .is_some_and(|content| content != self.local_content.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Sync result
// ---------------------------------------------------------------------------

/// Which operation produced a [`SyncResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Pull,
    Push,
    Sync,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Push => write!(f, "push"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Outcome of one pull, push or sync invocation; the caller's sole feedback
/// channel.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub operation: SyncOperation,
    pub success: bool,
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<String>,
    pub message: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn new(operation: SyncOperation, dry_run: bool) -> Self {
        Self {
            operation,
            success: true,
            pushed_count: 0,
            pulled_count: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
            message: String::new(),
            dry_run,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A failed result carrying a single error.
    pub fn failed(operation: SyncOperation, error: impl std::fmt::Display) -> Self {
        let mut result = Self::new(operation, false);
        result.fail(error);
        result.finish();
        result
    }

    /// Record a fatal error.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.success = false;
        let msg = error.to_string();
        self.message = format!("{} failed: {msg}", self.operation);
        self.errors.push(msg);
    }

    /// Record a non-fatal, per-file error.
    pub fn push_error(&mut self, error: impl std::fmt::Display) {
        self.errors.push(error.to_string());
    }

    /// Records left unresolved in this pass.
    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    /// Fold a later phase's result into this one.
    pub fn absorb(&mut self, other: SyncResult) {
        self.success &= other.success;
        self.pushed_count += other.pushed_count;
        self.pulled_count += other.pulled_count;
        self.conflicts.extend(other.conflicts);
        self.errors.extend(other.errors);
        if !other.success || self.message.is_empty() {
            self.message = other.message;
        }
    }

    /// Stamp completion and fill in a default summary message.
    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        if self.message.is_empty() {
            let unresolved = self.unresolved().count();
            self.message = format!(
                "{} complete: {} pulled, {} pushed, {} conflict(s), {} unresolved",
                self.operation,
                self.pulled_count,
                self.pushed_count,
                self.conflicts.len(),
                unresolved
            );
        }
    }
}
