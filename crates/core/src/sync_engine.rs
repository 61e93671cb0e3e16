//! Pull / push / bidirectional sync between the local tree and the remote.
//!
//! The [`SyncEngine`] sequences each operation linearly:
//!
//! 1. Pre-flight validation of the configuration.
//! 2. A safety snapshot of the local tree (fatal if it fails).
//! 3. **Pull**: fetch into the mirror, classify every eligible mirror file
//!    against the local tree, merge and resolve every conflict, and only
//!    then write resolved content into the local tree.
//! 4. **Push**: copy changed local files into the mirror, commit if the
//!    mirror changed, and push.
//!
//! A busy flag rejects a second operation while one is running.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::config::{expand_tilde, ConflictStrategy, SyncConfig};
use crate::conflict::{ConflictDetector, ConflictPrompt, ConflictResolver, ContentMerge, Merger};
use crate::errors::SyncError;
use crate::git::{CommitInfo, GitTransport, Transport, TransportStatus};
use crate::models::{SyncOperation, SyncResult};
use crate::scanner::{normalize_rel_path, walk_tree, FilePolicy, FsScanner, Scanner};

/// Remote name used for every transport call.
pub const REMOTE: &str = "origin";

/// Trailer embedded in sync-generated commit messages.
pub const SYNC_MARKER: &str = "[confsync]";

const PENDING_FILE: &str = "pending.json";

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Report what would change without touching the mirror or local tree.
    pub dry_run: bool,
    /// Pull: take the remote side of every conflict. Push: force the push.
    pub force: bool,
    /// Fail the pull (writing nothing) if any conflict is left unresolved.
    pub require_resolved: bool,
}

/// Paths skipped in an earlier pull, with the base commit they were
/// detected against. They keep conflicting until resolved and are held back
/// from push.
type PendingConflicts = BTreeMap<String, Option<String>>;

/// Orchestrates pull, push and sync for one local tree and one remote.
pub struct SyncEngine {
    config: SyncConfig,
    transport: Mutex<Box<dyn Transport + Send>>,
    scanner: Box<dyn Scanner>,
    backups: BackupManager,
    pending_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    started_at: Mutex<DateTime<Utc>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        transport: Box<dyn Transport + Send>,
        scanner: Box<dyn Scanner>,
        backups: BackupManager,
    ) -> Self {
        info!(
            repository = %config.sync.repository,
            branch = %config.sync.branch,
            strategy = %config.sync.conflict_strategy,
            "initializing sync engine"
        );
        Self {
            config,
            transport: Mutex::new(transport),
            scanner,
            backups,
            pending_path: None,
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(Utc::now()),
        }
    }

    /// Build an engine from configuration: bootstraps the git mirror, scans
    /// the configured local root, and keeps snapshots and pending-conflict
    /// state under the data directory.
    pub fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let local_root = expand_tilde(&config.paths.local_root);
        let data_dir = expand_tilde(&config.paths.data_dir);
        let transport = GitTransport::bootstrap(
            &config.sync.repository,
            &config.sync.branch,
            &expand_tilde(&config.paths.mirror_dir()),
        )?;
        let scanner = FsScanner::new(&local_root, FilePolicy::from(&config.sync));
        let backups = BackupManager::from_config(&config);
        Ok(Self::new(config, Box::new(transport), Box::new(scanner), backups)
            .with_pending_file(data_dir.join(PENDING_FILE)))
    }

    /// Persist skipped conflicts across runs in `path`.
    pub fn with_pending_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pending_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Result<TransportStatus, SyncError> {
        Ok(self.lock_transport().status()?)
    }

    pub fn log(&self, n: usize) -> Result<Vec<CommitInfo>, SyncError> {
        Ok(self.lock_transport().log(n)?)
    }

    /// Paths left unresolved by earlier pulls.
    pub fn pending_conflicts(&self) -> Vec<String> {
        self.load_pending().into_keys().collect()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    pub fn pull(&self, options: SyncOptions, prompt: &dyn ConflictPrompt) -> SyncResult {
        let _guard = match self.acquire(SyncOperation::Pull) {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(SyncOperation::Pull, e),
        };
        let mut result = self.run_pull(SyncOperation::Pull, options, prompt);
        result.finish();
        log_result(&result);
        result
    }

    pub fn push(&self, options: SyncOptions) -> SyncResult {
        let _guard = match self.acquire(SyncOperation::Push) {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(SyncOperation::Push, e),
        };
        let mut result = self.run_push(SyncOperation::Push, options, &BTreeSet::new());
        result.finish();
        log_result(&result);
        result
    }

    /// Pull followed by push. Push is skipped if pull failed; paths left
    /// unresolved by the pull are not pushed.
    pub fn sync(&self, options: SyncOptions, prompt: &dyn ConflictPrompt) -> SyncResult {
        let _guard = match self.acquire(SyncOperation::Sync) {
            Ok(guard) => guard,
            Err(e) => return SyncResult::failed(SyncOperation::Sync, e),
        };

        // `force` is per-direction and not forwarded by sync.
        let options = SyncOptions {
            force: false,
            ..options
        };

        let mut result = self.run_pull(SyncOperation::Sync, options, prompt);
        if result.success {
            let held: BTreeSet<String> = result.unresolved().map(|c| c.path.clone()).collect();
            let push = self.run_push(SyncOperation::Sync, options, &held);
            result.absorb(push);
        } else {
            warn!("pull failed, push not attempted");
        }
        result.finish();
        log_result(&result);
        result
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    fn run_pull(&self, op: SyncOperation, options: SyncOptions, prompt: &dyn ConflictPrompt) -> SyncResult {
        let mut result = SyncResult::new(op, options.dry_run);
        if let Err(e) = self.preflight(options) {
            result.fail(e);
            return result;
        }

        let branch = self.config.sync.branch.as_str();
        let local_root = self.scanner.root().to_path_buf();
        let pending = self.load_pending();

        let mut transport = self.lock_transport();
        let before = match transport.head_id() {
            Ok(id) => id,
            Err(e) => {
                result.fail(SyncError::from(e));
                return result;
            }
        };

        if options.dry_run {
            debug!("dry run, comparing against the mirror as last fetched");
        } else if let Err(e) = transport.pull(REMOTE, branch) {
            result.fail(SyncError::from(e));
            return result;
        }

        // The base is the last commit both sides share. After a rejected
        // push the pre-pull HEAD holds local edits, so it cannot be used as is.
        let base_commit = match (before, transport.head_id()) {
            (Some(before), Ok(Some(after))) if before != after => {
                match transport.merge_base(&before, &after) {
                    Ok(base) => base,
                    Err(e) => {
                        warn!(error = %e, "no merge base, falling back to two-way merge");
                        None
                    }
                }
            }
            (before, Ok(_)) => before,
            (_, Err(e)) => {
                result.fail(SyncError::from(e));
                return result;
            }
        };

        let mirror_root = transport.root().to_path_buf();
        let paths: Vec<String> = match walk_tree(&mirror_root) {
            Ok(all) => all
                .into_iter()
                .filter(|p| self.scanner.should_sync_file(p))
                .collect(),
            Err(e) => {
                result.fail(SyncError::fs(mirror_root.display().to_string(), &e));
                return result;
            }
        };

        let base_commit_for = |path: &str| -> Option<String> {
            match pending.get(path) {
                Some(recorded) => recorded.clone(),
                None => base_commit.clone(),
            }
        };
        let detection = ConflictDetector::detect(&local_root, &mirror_root, &paths, |path| {
            let commit = base_commit_for(path)?;
            match transport.read_file_at(&commit, path) {
                Ok(content) => content,
                Err(e) => {
                    debug!(path, error = %e, "base content unavailable");
                    None
                }
            }
        });
        drop(transport);

        for e in detection.errors {
            result.push_error(e);
        }

        // Every conflict is decided before anything is written.
        let strategy = if options.force {
            ConflictStrategy::Remote
        } else {
            self.config.sync.conflict_strategy
        };
        let merger = Merger::new(strategy);
        let resolver = ConflictResolver::new(strategy);
        let mut conflicts = detection.conflicts;
        for record in conflicts.iter_mut() {
            let ContentMerge { outcome, content } = merger.merge_contents(
                &record.path,
                &record.local_content,
                &record.remote_content,
                record.base_content.as_deref(),
            );
            let clean = outcome.merged;
            record.conflicting_keys = outcome.conflicting_keys;
            if options.dry_run {
                continue;
            }
            match content {
                Some(merged) if clean && !options.force => {
                    info!(path = %record.path, "structured merge applied");
                    record.resolve(merged);
                }
                content => {
                    resolver.resolve(record, content.as_deref(), prompt);
                }
            }
        }

        let unresolved = conflicts.iter().filter(|c| !c.is_resolved()).count();
        if options.dry_run {
            result.pulled_count = detection.incoming.len();
            result.conflicts = conflicts;
            return result;
        }

        if options.require_resolved && unresolved > 0 {
            // Nothing is written, so every current conflict stays pending.
            let pending_now: PendingConflicts = conflicts
                .iter()
                .map(|c| (c.path.clone(), base_commit_for(&c.path)))
                .collect();
            self.save_pending(&pending_now);
            result.conflicts = conflicts;
            result.fail(SyncError::ConflictUnresolved { count: unresolved });
            return result;
        }

        for record in &detection.incoming {
            match write_file(&local_root, &record.path, &record.content) {
                Ok(()) => result.pulled_count += 1,
                Err(e) => result.push_error(SyncError::fs(record.path.as_str(), &e)),
            }
        }
        for record in conflicts.iter().filter(|c| c.changes_local()) {
            let content = record.resolution().unwrap_or_default();
            match write_file(&local_root, &record.path, content) {
                Ok(()) => result.pulled_count += 1,
                Err(e) => result.push_error(SyncError::fs(record.path.as_str(), &e)),
            }
        }

        let still_pending: PendingConflicts = conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .map(|c| (c.path.clone(), base_commit_for(&c.path)))
            .collect();
        self.save_pending(&still_pending);

        result.conflicts = conflicts;
        info!(
            pulled = result.pulled_count,
            unresolved,
            unchanged = detection.unchanged,
            local_only = detection.local_only,
            "pull phase complete"
        );
        result
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    fn run_push(&self, op: SyncOperation, options: SyncOptions, hold: &BTreeSet<String>) -> SyncResult {
        let mut result = SyncResult::new(op, options.dry_run);
        if let Err(e) = self.preflight(options) {
            result.fail(e);
            return result;
        }

        let scan = match self.scanner.scan() {
            Ok(scan) => scan,
            Err(e) => {
                result.fail(SyncError::fs(self.scanner.root().display().to_string(), &e));
                return result;
            }
        };

        let mut held = hold.clone();
        if !options.force {
            held.extend(self.load_pending().into_keys());
        }

        let local_root = self.scanner.root();
        let mut transport = self.lock_transport();
        let mirror_root = transport.root().to_path_buf();

        let mut eligible = Vec::new();
        let mut changed = Vec::new();
        for abs in &scan.files {
            let Ok(rel) = abs.strip_prefix(local_root) else {
                continue;
            };
            let rel = normalize_rel_path(&rel.to_string_lossy());
            if held.contains(&rel) {
                debug!(path = %rel, "unresolved conflict, not pushing");
                continue;
            }
            eligible.push(rel.clone());
            let content = match std::fs::read(abs) {
                Ok(content) => content,
                Err(e) => {
                    result.push_error(SyncError::fs(rel.as_str(), &e));
                    continue;
                }
            };
            if matches!(std::fs::read(mirror_root.join(&rel)), Ok(ref m) if *m == content) {
                continue;
            }
            if !options.dry_run {
                if let Err(e) = write_file(&mirror_root, &rel, &content) {
                    result.push_error(SyncError::fs(rel.as_str(), &e));
                    continue;
                }
            }
            changed.push(rel);
        }
        result.pushed_count = changed.len();

        if options.dry_run {
            return result;
        }

        // Files copied by an earlier push whose commit failed match the local
        // tree already, so they only show up as uncommitted mirror changes.
        let to_stage = if !changed.is_empty() {
            changed
        } else {
            match transport.has_changes() {
                Ok(true) => {
                    warn!("mirror has uncommitted changes from an earlier push, committing them");
                    eligible
                }
                Ok(false) => Vec::new(),
                Err(e) => {
                    result.fail(SyncError::from(e));
                    return result;
                }
            }
        };

        let mut committed = None;
        if !to_stage.is_empty() {
            let staged = transport.add(&to_stage).and_then(|()| transport.has_changes());
            match staged {
                Ok(true) => match transport.commit(&commit_message(to_stage.len())) {
                    Ok(id) => committed = id,
                    Err(e) => {
                        result.fail(SyncError::from(e));
                        return result;
                    }
                },
                Ok(false) => debug!("mirror unchanged after staging"),
                Err(e) => {
                    result.fail(SyncError::from(e));
                    return result;
                }
            }
        }

        let ahead = match transport.status() {
            Ok(status) => status.ahead,
            Err(e) => {
                warn!(error = %e, "could not read mirror status");
                0
            }
        };
        if committed.is_some() || ahead > 0 || options.force {
            if let Err(e) = transport.push(REMOTE, &self.config.sync.branch, options.force) {
                result.fail(SyncError::from(e));
                return result;
            }
        } else {
            debug!("nothing to push");
        }

        info!(
            pushed = result.pushed_count,
            commit = committed.as_deref().unwrap_or("none"),
            held = held.len(),
            "push phase complete"
        );
        result
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn preflight(&self, options: SyncOptions) -> Result<(), SyncError> {
        self.config.validate()?;
        if !options.dry_run {
            let snapshot = self.backups.create_snapshot()?;
            debug!(id = %snapshot.id, "safety snapshot taken");
        }
        Ok(())
    }

    fn acquire(&self, op: SyncOperation) -> Result<SyncLockGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
            warn!(operation = %op, "sync already in progress, skipping");
            return Err(SyncError::AlreadyRunning {
                started_at: started_at.to_rfc3339(),
            });
        }
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
        Ok(SyncLockGuard(Arc::clone(&self.running)))
    }

    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn Transport + Send>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_pending(&self) -> PendingConflicts {
        let Some(path) = &self.pending_path else {
            return PendingConflicts::new();
        };
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt pending-conflict state");
                PendingConflicts::new()
            }),
            Err(_) => PendingConflicts::new(),
        }
    }

    fn save_pending(&self, pending: &PendingConflicts) {
        let Some(path) = &self.pending_path else {
            return;
        };
        let saved = serde_json::to_vec_pretty(pending)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });
        if let Err(e) = saved {
            warn!(path = %path.display(), error = %e, "failed to save pending-conflict state");
        }
    }
}

/// Clears the busy flag on drop, even on panic.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn log_result(result: &SyncResult) {
    if result.success {
        info!(
            operation = %result.operation,
            pulled = result.pulled_count,
            pushed = result.pushed_count,
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "{}",
            result.message
        );
    } else {
        warn!(operation = %result.operation, errors = result.errors.len(), "{}", result.message);
    }
}

fn write_file(root: &Path, rel: &str, content: &[u8]) -> std::io::Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

/// Commit message for a push of `count` files.
pub fn commit_message(count: usize) -> String {
    format!(
        "confsync: update {count} file(s) from {}\n\nSync-Marker: {SYNC_MARKER}\n",
        hostname()
    )
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_message_format() {
        let msg = commit_message(3);
        assert!(msg.starts_with("confsync: update 3 file(s) from "));
        assert!(msg.trim_end().ends_with("Sync-Marker: [confsync]"));
    }

    #[test]
    fn test_lock_guard_releases_on_drop() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _guard = SyncLockGuard(Arc::clone(&flag));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a/b/c.json", b"{}").unwrap();
        assert_eq!(std::fs::read(dir.path().join("a/b/c.json")).unwrap(), b"{}");
    }
}
