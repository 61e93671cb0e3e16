//! Conflict detection between the live local tree and the repository mirror.
//!
//! Every eligible file in the mirror is compared against its local
//! counterpart. When the last synced version (the base) is known, a file
//! changed on only one side is settled here without a conflict record.

use std::path::Path;

use tracing::{debug, info};

use crate::errors::SyncError;
use crate::models::{ConflictRecord, FileRecord};

/// How one mirror file relates to the local tree.
#[derive(Debug, Clone)]
pub enum FileChange {
    /// Both copies hold the same bytes.
    Unchanged,
    /// Only the local copy changed since the base; nothing to pull.
    LocalOnly,
    /// The file is new in the mirror or changed only remotely; copy it in.
    Incoming(FileRecord),
    /// Both copies changed (or no base is known) and they differ.
    Conflict(ConflictRecord),
}

/// Everything a pull pass needs to do, gathered before any write.
#[derive(Debug, Default)]
pub struct Detection {
    pub incoming: Vec<FileRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub unchanged: usize,
    pub local_only: usize,
    /// Per-file read errors; the affected files are left out of the pass.
    pub errors: Vec<SyncError>,
}

/// Stateless detector.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify one file from its local copy (if any), its mirror copy, and
    /// its base content (if known).
    pub fn classify(local: Option<FileRecord>, remote: FileRecord, base: Option<Vec<u8>>) -> FileChange {
        let Some(local) = local else {
            return FileChange::Incoming(remote);
        };

        if local.content == remote.content {
            return FileChange::Unchanged;
        }

        match base {
            Some(ref b) if *b == remote.content => FileChange::LocalOnly,
            Some(ref b) if *b == local.content => FileChange::Incoming(remote),
            base => FileChange::Conflict(ConflictRecord::new(local, remote, base)),
        }
    }

    /// Compare `paths` (relative to both roots) between the local tree and
    /// the mirror. `base_of` returns the last synced content of a path.
    pub fn detect<F>(local_root: &Path, mirror_root: &Path, paths: &[String], base_of: F) -> Detection
    where
        F: Fn(&str) -> Option<Vec<u8>>,
    {
        let mut detection = Detection::default();

        for path in paths {
            let remote = match FileRecord::read(mirror_root, path) {
                Ok(r) => r,
                Err(e) => {
                    detection.errors.push(SyncError::fs(path.as_str(), &e));
                    continue;
                }
            };

            let local = match FileRecord::read(local_root, path) {
                Ok(l) => Some(l),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    detection.errors.push(SyncError::fs(path.as_str(), &e));
                    continue;
                }
            };

            let base = if local.is_some() { base_of(path) } else { None };
            match Self::classify(local, remote, base) {
                FileChange::Unchanged => detection.unchanged += 1,
                FileChange::LocalOnly => {
                    debug!(path = %path, "changed locally only");
                    detection.local_only += 1;
                }
                FileChange::Incoming(record) => {
                    debug!(path = %path, "incoming change");
                    detection.incoming.push(record);
                }
                FileChange::Conflict(record) => {
                    debug!(path = %path, has_base = record.base_content.is_some(), "conflict detected");
                    detection.conflicts.push(record);
                }
            }
        }

        info!(
            incoming = detection.incoming.len(),
            conflicts = detection.conflicts.len(),
            unchanged = detection.unchanged,
            local_only = detection.local_only,
            errors = detection.errors.len(),
            "detection complete"
        );
        detection
    }
}
