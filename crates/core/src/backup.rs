//! Safety snapshots of the local tree.
//!
//! A snapshot is a directory under the backup root holding a copy of every
//! file in the local tree plus a `manifest.json` that records each file's
//! SHA-256. Snapshots are taken before every destructive sync step and are
//! only removed by retention trimming (oldest first).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{expand_tilde, SyncConfig};
use crate::errors::BackupError;
use crate::scanner::walk_tree;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// A snapshot as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Directory holding the snapshot.
    pub location: PathBuf,
    /// Relative paths captured, sorted.
    pub files: Vec<String>,
}

/// On-disk manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    sha256: String,
    size: u64,
}

/// On-disk manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    id: String,
    timestamp: DateTime<Utc>,
    files: Vec<ManifestEntry>,
}

/// Outcome of a restore: every file is attempted.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub errors: Vec<String>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Creates, lists, restores and trims snapshots of one local tree.
#[derive(Debug, Clone)]
pub struct BackupManager {
    local_root: PathBuf,
    backup_dir: PathBuf,
    max_snapshots: usize,
}

impl BackupManager {
    pub fn new(local_root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            local_root: local_root.into(),
            backup_dir: backup_dir.into(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Manager for the configured local tree and backup directory.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            expand_tilde(&config.paths.local_root),
            expand_tilde(&config.paths.backup_dir()),
            config.backup.max_snapshots,
        )
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy the whole local tree into a new snapshot, then trim old ones.
    ///
    /// Every file is attempted; if any cannot be captured the partial
    /// snapshot is discarded and an error is returned, so callers never
    /// proceed on an incomplete safety net.
    pub fn create_snapshot(&self) -> Result<SnapshotInfo, BackupError> {
        let snapshot = self.capture()?;
        if let Err(e) = self.trim() {
            warn!(error = %e, "snapshot retention trimming failed");
        }
        Ok(snapshot)
    }

    /// Restore the snapshot matching `key` after capturing the current tree.
    /// Trimming runs only after the restore, so the target cannot be
    /// evicted by the safety snapshot.
    pub fn restore_with_safety(&self, key: &str) -> Result<(SnapshotInfo, RestoreReport), BackupError> {
        let target = self.find_snapshot(key)?;
        let safety = self.capture()?;
        let report = self.restore_snapshot(&target.location)?;
        if let Err(e) = self.trim() {
            warn!(error = %e, "snapshot retention trimming failed");
        }
        Ok((safety, report))
    }

    fn capture(&self) -> Result<SnapshotInfo, BackupError> {
        let timestamp = Utc::now();
        let id = format!(
            "{}-{}",
            timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let location = self.backup_dir.join(&id);
        let files_dir = location.join(FILES_DIR);
        std::fs::create_dir_all(&files_dir)?;

        let rel_paths = if self.local_root.exists() {
            walk_tree(&self.local_root)?
        } else {
            Vec::new()
        };

        let mut entries = Vec::with_capacity(rel_paths.len());
        let mut failed = 0usize;
        for rel in &rel_paths {
            match copy_with_digest(&self.local_root.join(rel), &files_dir.join(rel)) {
                Ok((sha256, size)) => entries.push(ManifestEntry {
                    path: rel.clone(),
                    sha256,
                    size,
                }),
                Err(e) => {
                    warn!(path = %rel, error = %e, "failed to capture file");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            if let Err(e) = std::fs::remove_dir_all(&location) {
                warn!(location = %location.display(), error = %e, "failed to discard partial snapshot");
            }
            return Err(BackupError::PartialFailure {
                operation: "snapshot",
                failed,
            });
        }

        let manifest = Manifest {
            id: id.clone(),
            timestamp,
            files: entries,
        };
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| BackupError::InvalidManifest {
            path: location.join(MANIFEST_FILE).display().to_string(),
            detail: e.to_string(),
        })?;
        std::fs::write(location.join(MANIFEST_FILE), json)?;

        info!(id = %id, files = rel_paths.len(), "snapshot created");

        Ok(SnapshotInfo {
            id,
            timestamp,
            location,
            files: rel_paths,
        })
    }

    /// All snapshots, newest first. Directories without a readable manifest
    /// are skipped.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, BackupError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match read_manifest(&entry.path()) {
                Ok(manifest) => snapshots.push(SnapshotInfo {
                    id: manifest.id,
                    timestamp: manifest.timestamp,
                    location: entry.path(),
                    files: manifest.files.into_iter().map(|f| f.path).collect(),
                }),
                Err(e) => debug!(dir = %entry.path().display(), error = %e, "ignoring non-snapshot directory"),
            }
        }

        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Find a snapshot by id (or unique id prefix) or by its directory.
    pub fn find_snapshot(&self, key: &str) -> Result<SnapshotInfo, BackupError> {
        let snapshots = self.list_snapshots()?;
        let key_path = Path::new(key);
        let mut matches = snapshots
            .into_iter()
            .filter(|s| s.id.starts_with(key) || s.location == key_path);
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            _ => Err(BackupError::SnapshotNotFound(key.to_string())),
        }
    }

    /// Copy a snapshot's files back over the local tree.
    ///
    /// Every file is attempted; digest mismatches and copy failures are
    /// collected in the report. Files created since the snapshot are left
    /// in place.
    pub fn restore_snapshot(&self, location: &Path) -> Result<RestoreReport, BackupError> {
        if !location.join(MANIFEST_FILE).exists() {
            return Err(BackupError::SnapshotNotFound(location.display().to_string()));
        }
        let manifest = read_manifest(location)?;
        let files_dir = location.join(FILES_DIR);
        let mut report = RestoreReport::default();

        for entry in &manifest.files {
            let src = files_dir.join(&entry.path);
            let dst = self.local_root.join(&entry.path);
            match copy_with_digest(&src, &dst) {
                Ok((sha256, _)) if sha256 == entry.sha256 => report.restored += 1,
                Ok(_) => report
                    .errors
                    .push(format!("{}: digest mismatch after restore", entry.path)),
                Err(e) => report.errors.push(format!("{}: {e}", entry.path)),
            }
        }

        info!(
            id = %manifest.id,
            restored = report.restored,
            failed = report.errors.len(),
            "snapshot restored"
        );
        Ok(report)
    }

    /// Delete the oldest snapshots beyond the retention limit. Returns the
    /// number removed.
    pub fn trim(&self) -> Result<usize, BackupError> {
        let snapshots = self.list_snapshots()?;
        let mut removed = 0;
        for old in snapshots.iter().skip(self.max_snapshots) {
            std::fs::remove_dir_all(&old.location)?;
            debug!(id = %old.id, "evicted snapshot");
            removed += 1;
        }
        if removed > 0 {
            info!(removed, keep = self.max_snapshots, "trimmed snapshots");
        }
        Ok(removed)
    }
}

fn read_manifest(dir: &Path) -> Result<Manifest, BackupError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| BackupError::InvalidManifest {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Copy `src` to `dst` (creating parents) and return the SHA-256 of the
/// bytes written along with their length.
fn copy_with_digest(src: &Path, dst: &Path) -> std::io::Result<(String, u64)> {
    let bytes = std::fs::read(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dst, &bytes)?;
    let written = std::fs::read(dst)?;
    Ok((hex::encode(Sha256::digest(&written)), written.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(root.join("skills/a")).unwrap();
        std::fs::write(root.join("settings.json"), "{\"a\":1}").unwrap();
        std::fs::write(root.join("skills/a/SKILL.md"), "skill").unwrap();
        let mgr = BackupManager::new(&root, dir.path().join("backups"), 3);
        (dir, mgr)
    }

    #[test]
    fn test_create_and_list() {
        let (_dir, mgr) = setup();
        let snap = mgr.create_snapshot().unwrap();
        assert_eq!(snap.files, vec!["settings.json", "skills/a/SKILL.md"]);
        assert!(snap.location.join("files/skills/a/SKILL.md").exists());

        let listed = mgr.list_snapshots().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], snap);
    }

    #[test]
    fn test_list_newest_first() {
        let (_dir, mgr) = setup();
        let first = mgr.create_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = mgr.create_snapshot().unwrap();
        let listed = mgr.list_snapshots().unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[test]
    fn test_restore_overwrites_changes() {
        let (dir, mgr) = setup();
        let snap = mgr.create_snapshot().unwrap();
        let root = dir.path().join("tree");
        std::fs::write(root.join("settings.json"), "clobbered").unwrap();
        std::fs::remove_file(root.join("skills/a/SKILL.md")).unwrap();
        std::fs::write(root.join("extra.txt"), "new").unwrap();

        let report = mgr.restore_snapshot(&snap.location).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored, 2);
        assert_eq!(std::fs::read_to_string(root.join("settings.json")).unwrap(), "{\"a\":1}");
        assert!(root.join("skills/a/SKILL.md").exists());
        assert!(root.join("extra.txt").exists());
    }

    #[test]
    fn test_restore_missing_file_keeps_going() {
        let (dir, mgr) = setup();
        let snap = mgr.create_snapshot().unwrap();
        std::fs::remove_file(snap.location.join("files/settings.json")).unwrap();
        std::fs::write(dir.path().join("tree/skills/a/SKILL.md"), "changed").unwrap();

        let report = mgr.restore_snapshot(&snap.location).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("settings.json"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tree/skills/a/SKILL.md")).unwrap(),
            "skill"
        );
    }

    #[test]
    fn test_restore_unknown_location() {
        let (dir, mgr) = setup();
        let result = mgr.restore_snapshot(&dir.path().join("nope"));
        assert!(matches!(result, Err(BackupError::SnapshotNotFound(_))));
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let (_dir, mgr) = setup();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(mgr.create_snapshot().unwrap().id);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let listed: Vec<String> = mgr.list_snapshots().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_find_snapshot_by_prefix() {
        let (_dir, mgr) = setup();
        let snap = mgr.create_snapshot().unwrap();
        assert_eq!(mgr.find_snapshot(&snap.id).unwrap().id, snap.id);
        assert_eq!(
            mgr.find_snapshot(&snap.location.display().to_string()).unwrap().id,
            snap.id
        );
        assert!(matches!(
            mgr.find_snapshot("19700101"),
            Err(BackupError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_restore_with_safety_keeps_target_at_capacity() {
        let (dir, mgr) = setup();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(mgr.create_snapshot().unwrap().id);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        std::fs::write(dir.path().join("tree/settings.json"), "edited").unwrap();

        // The oldest snapshot is the target; at capacity it would be evicted
        // if the safety snapshot trimmed first.
        let (safety, report) = mgr.restore_with_safety(&ids[0]).unwrap();
        assert!(report.is_complete());
        assert_eq!(std::fs::read_to_string(dir.path().join("tree/settings.json")).unwrap(), "{\"a\":1}");

        let listed: Vec<String> = mgr.list_snapshots().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0], safety.id);
        assert!(!listed.contains(&ids[0]));
    }

    #[test]
    fn test_snapshot_of_missing_tree_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path().join("absent"), dir.path().join("b"), 2);
        let snap = mgr.create_snapshot().unwrap();
        assert!(snap.files.is_empty());
    }
}
