//! The version-control seam consumed by the sync engine.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

/// Working-tree and branch state of the mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatus {
    /// Commits on the mirror branch not yet on the remote.
    pub ahead: usize,
    /// Commits on the remote not yet in the mirror branch.
    pub behind: usize,
    pub conflicted: usize,
    pub staged: usize,
    pub untracked: usize,
}

/// A single commit in the mirror's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

impl CommitInfo {
    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Primitive operations on the repository mirror.
///
/// Construction is left to implementations; the engine only ever sees an
/// already bootstrapped mirror.
pub trait Transport {
    /// Working-tree root of the mirror.
    fn root(&self) -> &Path;

    /// Fetch `branch` from `remote` and move the mirror onto it. Returns
    /// whether the mirror's HEAD changed. A remote without the branch yet is
    /// not an error.
    fn pull(&mut self, remote: &str, branch: &str) -> Result<bool, TransportError>;

    /// Push the mirror branch. `force` overwrites the remote branch.
    fn push(&mut self, remote: &str, branch: &str, force: bool) -> Result<(), TransportError>;

    /// Stage the given relative paths (deleted paths are unstaged).
    fn add(&mut self, paths: &[String]) -> Result<(), TransportError>;

    /// Commit the index. Returns `None` without committing when the index
    /// matches HEAD.
    fn commit(&mut self, message: &str) -> Result<Option<String>, TransportError>;

    /// Whether the working tree or index differs from HEAD.
    fn has_changes(&self) -> Result<bool, TransportError>;

    fn status(&self) -> Result<TransportStatus, TransportError>;

    /// Up to `n` commits, newest first.
    fn log(&self, n: usize) -> Result<Vec<CommitInfo>, TransportError>;

    /// Current HEAD commit, `None` on an unborn branch.
    fn head_id(&self) -> Result<Option<String>, TransportError>;

    /// Best common ancestor of two commits, `None` for unrelated histories.
    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, TransportError>;

    /// Content of `path` as of `commit`, `None` if it did not exist there.
    fn read_file_at(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, TransportError>;
}
