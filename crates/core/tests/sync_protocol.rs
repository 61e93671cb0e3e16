//! Pull / push protocol tests for `SyncEngine` against an in-memory
//! transport.
//!
//! The mock's mirror is a plain temp directory that each test fills in as
//! "what the remote looks like after fetch"; base content and commit state
//! are held in memory so every scenario is deterministic and offline.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use confsync_core::backup::BackupManager;
use confsync_core::config::{ConflictStrategy, SyncConfig};
use confsync_core::conflict::{Choice, ConflictPrompt, SkipPrompt};
use confsync_core::errors::TransportError;
use confsync_core::git::{CommitInfo, Transport, TransportStatus};
use confsync_core::models::ConflictRecord;
use confsync_core::scanner::{FilePolicy, FsScanner};
use confsync_core::sync_engine::{SyncEngine, SyncOptions};

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Debug, Default)]
struct Calls {
    pulls: usize,
    pushes: usize,
    forced_pushes: usize,
    commits: Vec<String>,
}

struct MockTransport {
    root: PathBuf,
    head: Option<String>,
    base: HashMap<String, Vec<u8>>,
    fail_pull: bool,
    /// Number of upcoming commits that fail.
    fail_commits: usize,
    dirty: bool,
    ahead: usize,
    calls: Arc<Mutex<Calls>>,
}

impl Transport for MockTransport {
    fn root(&self) -> &Path {
        &self.root
    }

    fn pull(&mut self, remote: &str, branch: &str) -> Result<bool, TransportError> {
        self.calls.lock().unwrap().pulls += 1;
        if self.fail_pull {
            return Err(TransportError::PullFailed {
                remote: remote.into(),
                branch: branch.into(),
                detail: "network unreachable".into(),
            });
        }
        Ok(false)
    }

    fn push(&mut self, _remote: &str, _branch: &str, force: bool) -> Result<(), TransportError> {
        let mut calls = self.calls.lock().unwrap();
        calls.pushes += 1;
        if force {
            calls.forced_pushes += 1;
        }
        self.ahead = 0;
        Ok(())
    }

    fn add(&mut self, paths: &[String]) -> Result<(), TransportError> {
        self.dirty |= !paths.is_empty();
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<Option<String>, TransportError> {
        if !self.dirty {
            return Ok(None);
        }
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(git2::Error::from_str("index.lock exists").into());
        }
        self.dirty = false;
        self.ahead += 1;
        let mut calls = self.calls.lock().unwrap();
        calls.commits.push(message.to_string());
        let id = format!("commit-{}", calls.commits.len());
        self.head = Some(id.clone());
        Ok(Some(id))
    }

    fn has_changes(&self) -> Result<bool, TransportError> {
        Ok(self.dirty)
    }

    fn status(&self) -> Result<TransportStatus, TransportError> {
        Ok(TransportStatus {
            ahead: self.ahead,
            ..Default::default()
        })
    }

    fn log(&self, _n: usize) -> Result<Vec<CommitInfo>, TransportError> {
        Ok(Vec::new())
    }

    fn head_id(&self) -> Result<Option<String>, TransportError> {
        Ok(self.head.clone())
    }

    fn merge_base(&self, a: &str, _b: &str) -> Result<Option<String>, TransportError> {
        Ok(Some(a.to_string()))
    }

    fn read_file_at(&self, _commit: &str, path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.base.get(path).cloned())
    }
}

struct Harness {
    dir: TempDir,
    calls: Arc<Mutex<Calls>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("local")).unwrap();
        std::fs::create_dir_all(dir.path().join("mirror")).unwrap();
        Self {
            dir,
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    fn local(&self) -> PathBuf {
        self.dir.path().join("local")
    }

    fn mirror(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    fn backups(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    fn write_local(&self, rel: &str, content: &str) {
        write(&self.local().join(rel), content);
    }

    fn write_mirror(&self, rel: &str, content: &str) {
        write(&self.mirror().join(rel), content);
    }

    fn read_local(&self, rel: &str) -> String {
        std::fs::read_to_string(self.local().join(rel)).unwrap()
    }

    fn engine(&self, strategy: ConflictStrategy) -> SyncEngine {
        self.engine_with(strategy, None, HashMap::new(), false)
    }

    fn engine_with(
        &self,
        strategy: ConflictStrategy,
        head: Option<&str>,
        base: HashMap<String, Vec<u8>>,
        fail_pull: bool,
    ) -> SyncEngine {
        let transport = MockTransport {
            root: self.mirror(),
            head: head.map(str::to_string),
            base,
            fail_pull,
            fail_commits: 0,
            dirty: false,
            ahead: 0,
            calls: Arc::clone(&self.calls),
        };
        self.engine_over(strategy, transport)
    }

    fn engine_failing_commits(&self, count: usize) -> SyncEngine {
        let transport = MockTransport {
            root: self.mirror(),
            head: None,
            base: HashMap::new(),
            fail_pull: false,
            fail_commits: count,
            dirty: false,
            ahead: 0,
            calls: Arc::clone(&self.calls),
        };
        self.engine_over(ConflictStrategy::Ask, transport)
    }

    fn engine_over(&self, strategy: ConflictStrategy, transport: MockTransport) -> SyncEngine {
        let mut config = SyncConfig::new("file:///srv/confsync.git");
        config.sync.conflict_strategy = strategy;
        let scanner = FsScanner::new(self.local(), FilePolicy::from(&config.sync));
        let backups = BackupManager::new(self.local(), self.backups(), 5);
        SyncEngine::new(config, Box::new(transport), Box::new(scanner), backups)
            .with_pending_file(self.dir.path().join("pending.json"))
    }
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

fn json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap()
}

/// Prompt answering per path, skipping anything not listed.
struct ScriptedPrompt {
    answers: HashMap<&'static str, Choice>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedPrompt {
    fn new(answers: &[(&'static str, Choice)]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            asked: RefCell::new(Vec::new()),
        }
    }
}

impl ConflictPrompt for ScriptedPrompt {
    fn choose(&self, record: &ConflictRecord, _merged: Option<&[u8]>) -> Choice {
        self.asked.borrow_mut().push(record.path.clone());
        self.answers
            .get(record.path.as_str())
            .copied()
            .unwrap_or(Choice::Skip)
    }
}

// ===========================================================================
// Pull
// ===========================================================================

#[test]
fn test_pull_with_one_skipped_conflict_writes_the_rest() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local a");
    h.write_mirror("skills/a.md", "remote a");
    h.write_local("skills/b.md", "local b");
    h.write_mirror("skills/b.md", "remote b");
    h.write_mirror("skills/new.md", "brand new");

    let engine = h.engine(ConflictStrategy::Ask);
    let prompt = ScriptedPrompt::new(&[("skills/b.md", Choice::Remote)]);
    let result = engine.pull(SyncOptions::default(), &prompt);

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.conflicts.len(), 2);
    let skipped: Vec<&str> = result.unresolved().map(|c| c.path.as_str()).collect();
    assert_eq!(skipped, vec!["skills/a.md"]);

    assert_eq!(h.read_local("skills/a.md"), "local a");
    assert_eq!(h.read_local("skills/b.md"), "remote b");
    assert_eq!(h.read_local("skills/new.md"), "brand new");
    assert_eq!(result.pulled_count, 2);
    assert_eq!(engine.pending_conflicts(), vec!["skills/a.md".to_string()]);
}

#[test]
fn test_pull_merges_disjoint_json_without_asking() {
    let h = Harness::new();
    h.write_local("settings.json", r#"{"a": 1, "b": 2}"#);
    h.write_mirror("settings.json", r#"{"b": 2, "c": 4}"#);

    let engine = h.engine(ConflictStrategy::Ask);
    let prompt = ScriptedPrompt::new(&[]);
    let result = engine.pull(SyncOptions::default(), &prompt);

    assert!(result.success);
    assert!(prompt.asked.borrow().is_empty());
    assert!(result.conflicts[0].is_resolved());
    assert!(result.conflicts[0].conflicting_keys.is_empty());
    assert_eq!(json(&h.read_local("settings.json")), json(r#"{"a": 1, "b": 2, "c": 4}"#));
}

#[test]
fn test_pull_two_way_conflicting_key_is_offered_merge() {
    let h = Harness::new();
    h.write_local("settings.json", r#"{"a": 1, "b": 2}"#);
    h.write_mirror("settings.json", r#"{"b": 3, "c": 4}"#);

    let engine = h.engine(ConflictStrategy::Ask);
    let prompt = ScriptedPrompt::new(&[("settings.json", Choice::Merge)]);
    let result = engine.pull(SyncOptions::default(), &prompt);

    assert_eq!(result.conflicts[0].conflicting_keys, vec!["b".to_string()]);
    assert_eq!(json(&h.read_local("settings.json")), json(r#"{"a": 1, "b": 3, "c": 4}"#));
}

#[test]
fn test_pull_three_way_settles_one_sided_edits() {
    let h = Harness::new();
    h.write_local("settings.json", r#"{"a": 2, "b": 1}"#);
    h.write_mirror("settings.json", r#"{"a": 1, "b": 3}"#);
    h.write_local("skills/local-edit.md", "mine");
    h.write_mirror("skills/local-edit.md", "old");
    h.write_local("skills/remote-edit.md", "old");
    h.write_mirror("skills/remote-edit.md", "theirs");

    let base = HashMap::from([
        ("settings.json".to_string(), br#"{"a": 1, "b": 1}"#.to_vec()),
        ("skills/local-edit.md".to_string(), b"old".to_vec()),
        ("skills/remote-edit.md".to_string(), b"old".to_vec()),
    ]);
    let engine = h.engine_with(ConflictStrategy::Ask, Some("c0"), base, false);
    let prompt = ScriptedPrompt::new(&[]);
    let result = engine.pull(SyncOptions::default(), &prompt);

    assert!(result.success);
    assert!(prompt.asked.borrow().is_empty());
    assert_eq!(result.unresolved().count(), 0);
    assert_eq!(json(&h.read_local("settings.json")), json(r#"{"a": 2, "b": 3}"#));
    assert_eq!(h.read_local("skills/local-edit.md"), "mine");
    assert_eq!(h.read_local("skills/remote-edit.md"), "theirs");
}

#[test]
fn test_pull_newest_prefers_later_local_file() {
    let h = Harness::new();
    h.write_local("skills/notes.md", "local");
    h.write_mirror("skills/notes.md", "remote");
    let now = SystemTime::now();
    set_mtime(&h.local().join("skills/notes.md"), now);
    set_mtime(&h.mirror().join("skills/notes.md"), now - Duration::from_secs(3600));

    let result = h
        .engine(ConflictStrategy::Newest)
        .pull(SyncOptions::default(), &SkipPrompt);

    assert!(result.conflicts[0].is_resolved());
    assert_eq!(result.conflicts[0].resolution(), Some(&b"local"[..]));
    assert_eq!(h.read_local("skills/notes.md"), "local");
    assert_eq!(result.pulled_count, 0);
}

#[test]
fn test_pull_newest_takes_later_remote_file() {
    let h = Harness::new();
    h.write_local("skills/notes.md", "local");
    h.write_mirror("skills/notes.md", "remote");
    let now = SystemTime::now();
    set_mtime(&h.local().join("skills/notes.md"), now - Duration::from_secs(3600));
    set_mtime(&h.mirror().join("skills/notes.md"), now);

    let result = h
        .engine(ConflictStrategy::Newest)
        .pull(SyncOptions::default(), &SkipPrompt);

    assert_eq!(h.read_local("skills/notes.md"), "remote");
    assert_eq!(result.pulled_count, 1);
}

#[test]
fn test_pull_force_takes_remote_for_everything() {
    let h = Harness::new();
    h.write_local("settings.json", r#"{"a": 1}"#);
    h.write_mirror("settings.json", r#"{"b": 2}"#);
    h.write_local("skills/x.md", "local");
    h.write_mirror("skills/x.md", "remote");

    let options = SyncOptions {
        force: true,
        ..Default::default()
    };
    let result = h.engine(ConflictStrategy::Local).pull(options, &SkipPrompt);

    assert!(result.success);
    assert_eq!(h.read_local("settings.json"), r#"{"b": 2}"#);
    assert_eq!(h.read_local("skills/x.md"), "remote");
}

#[test]
fn test_pull_require_resolved_writes_nothing() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local");
    h.write_mirror("skills/a.md", "remote");
    h.write_mirror("skills/new.md", "new");

    let options = SyncOptions {
        require_resolved: true,
        ..Default::default()
    };
    let result = h.engine(ConflictStrategy::Ask).pull(options, &SkipPrompt);

    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("1 conflict(s) left unresolved")));
    assert!(!h.local().join("skills/new.md").exists());
    assert_eq!(result.pulled_count, 0);
}

#[cfg(unix)]
#[test]
fn test_pull_write_failure_does_not_stop_the_batch() {
    let h = Harness::new();
    h.write_mirror("skills/blocked.md", "remote");
    h.write_mirror("skills/ok.md", "ok");
    // Reads as absent, but writing through it fails: the target's
    // directory does not exist.
    std::fs::create_dir_all(h.local().join("skills")).unwrap();
    std::os::unix::fs::symlink(
        h.dir.path().join("missing/target.md"),
        h.local().join("skills/blocked.md"),
    )
    .unwrap();

    let result = h.engine(ConflictStrategy::Ask).pull(SyncOptions::default(), &SkipPrompt);

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("skills/blocked.md"));
    assert_eq!(h.read_local("skills/ok.md"), "ok");
    assert_eq!(result.pulled_count, 1);
}

#[test]
fn test_pull_require_resolved_refreshes_pending_state() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local");
    h.write_mirror("skills/a.md", "remote");
    std::fs::write(
        h.dir.path().join("pending.json"),
        r#"{"skills/gone.md": null}"#,
    )
    .unwrap();

    let engine = h.engine(ConflictStrategy::Ask);
    assert_eq!(engine.pending_conflicts(), vec!["skills/gone.md".to_string()]);

    let options = SyncOptions {
        require_resolved: true,
        ..Default::default()
    };
    let result = engine.pull(options, &SkipPrompt);

    assert!(!result.success);
    assert_eq!(engine.pending_conflicts(), vec!["skills/a.md".to_string()]);
}

#[test]
fn test_pull_dry_run_touches_nothing() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local");
    h.write_mirror("skills/a.md", "remote");
    h.write_mirror("skills/new.md", "new");

    let engine = h.engine(ConflictStrategy::Remote);
    let options = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let result = engine.pull(options, &SkipPrompt);

    assert!(result.success);
    assert!(result.dry_run);
    assert_eq!(result.pulled_count, 1);
    assert_eq!(result.conflicts.len(), 1);
    assert!(!result.conflicts[0].is_resolved());
    assert_eq!(h.read_local("skills/a.md"), "local");
    assert!(!h.local().join("skills/new.md").exists());
    assert_eq!(h.calls.lock().unwrap().pulls, 0);
    assert!(engine.backups().list_snapshots().unwrap().is_empty());
}

#[test]
fn test_pull_transport_failure_is_reported() {
    let h = Harness::new();
    h.write_mirror("skills/new.md", "new");
    let engine = h.engine_with(ConflictStrategy::Ask, None, HashMap::new(), true);

    let result = engine.sync(SyncOptions::default(), &SkipPrompt);

    assert!(!result.success);
    assert!(result.message.starts_with("sync failed"));
    assert!(result.errors[0].contains("network unreachable"));
    assert!(!h.local().join("skills/new.md").exists());
    assert_eq!(h.calls.lock().unwrap().pushes, 0);
    // The safety snapshot was still taken before the transport ran.
    assert_eq!(engine.backups().list_snapshots().unwrap().len(), 1);
}

#[test]
fn test_snapshot_failure_aborts_before_transport() {
    let h = Harness::new();
    h.write_local("skills/a.md", "a");
    // A regular file where the backup directory should be.
    std::fs::write(h.backups(), "not a directory").unwrap();

    let result = h.engine(ConflictStrategy::Ask).pull(SyncOptions::default(), &SkipPrompt);

    assert!(!result.success);
    assert!(result.errors[0].contains("backup"));
    assert_eq!(h.calls.lock().unwrap().pulls, 0);
}

// ===========================================================================
// Push
// ===========================================================================

#[test]
fn test_push_twice_is_idempotent() {
    let h = Harness::new();
    h.write_local("settings.json", "{}");
    h.write_local("skills/a/SKILL.md", "skill");
    h.write_local("debug.log", "excluded");

    let engine = h.engine(ConflictStrategy::Ask);
    let first = engine.push(SyncOptions::default());
    assert!(first.success, "errors: {:?}", first.errors);
    assert_eq!(first.pushed_count, 2);
    assert!(h.mirror().join("skills/a/SKILL.md").exists());
    assert!(!h.mirror().join("debug.log").exists());

    let second = engine.push(SyncOptions::default());
    assert!(second.success);
    assert_eq!(second.pushed_count, 0);

    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.commits.len(), 1);
    assert_eq!(calls.pushes, 1);
    assert!(calls.commits[0].starts_with("confsync: update 2 file(s) from "));
    assert!(calls.commits[0].contains("Sync-Marker: [confsync]"));
}

#[test]
fn test_push_copy_failure_does_not_stop_the_batch() {
    let h = Harness::new();
    h.write_local("skills/blocked/SKILL.md", "skill");
    h.write_local("skills/ok.md", "ok");
    // A plain file in the mirror where the copy's directory should go.
    h.write_mirror("skills/blocked", "in the way");

    let result = h.engine(ConflictStrategy::Ask).push(SyncOptions::default());

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("skills/blocked/SKILL.md"));
    assert_eq!(std::fs::read_to_string(h.mirror().join("skills/ok.md")).unwrap(), "ok");
    assert_eq!(result.pushed_count, 1);
    assert_eq!(h.calls.lock().unwrap().commits.len(), 1);
}

#[test]
fn test_push_commits_files_left_by_a_failed_commit() {
    let h = Harness::new();
    h.write_local("settings.json", "{}");
    let engine = h.engine_failing_commits(1);

    let first = engine.push(SyncOptions::default());
    assert!(!first.success);
    assert!(h.mirror().join("settings.json").exists());
    assert_eq!(h.calls.lock().unwrap().pushes, 0);

    // The mirror already matches the local tree; the leftover change is
    // still committed and pushed.
    let second = engine.push(SyncOptions::default());
    assert!(second.success, "errors: {:?}", second.errors);
    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.commits.len(), 1);
    assert_eq!(calls.pushes, 1);

    drop(calls);
    let third = engine.push(SyncOptions::default());
    assert!(third.success);
    assert_eq!(h.calls.lock().unwrap().commits.len(), 1);
}

#[test]
fn test_push_dry_run_counts_without_copying() {
    let h = Harness::new();
    h.write_local("settings.json", "{}");

    let result = h.engine(ConflictStrategy::Ask).push(SyncOptions {
        dry_run: true,
        ..Default::default()
    });

    assert_eq!(result.pushed_count, 1);
    assert!(!h.mirror().join("settings.json").exists());
    assert!(h.calls.lock().unwrap().commits.is_empty());
}

#[test]
fn test_push_force_uses_forced_push() {
    let h = Harness::new();
    h.write_local("settings.json", "{}");

    let result = h.engine(ConflictStrategy::Ask).push(SyncOptions {
        force: true,
        ..Default::default()
    });

    assert!(result.success);
    assert_eq!(h.calls.lock().unwrap().forced_pushes, 1);
}

#[test]
fn test_skipped_conflict_is_held_back_from_push() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local");
    h.write_mirror("skills/a.md", "remote");
    h.write_local("skills/b.md", "only local");

    let engine = h.engine(ConflictStrategy::Ask);
    let result = engine.sync(SyncOptions::default(), &SkipPrompt);

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.unresolved().count(), 1);
    assert_eq!(result.pushed_count, 1);
    assert_eq!(std::fs::read_to_string(h.mirror().join("skills/a.md")).unwrap(), "remote");

    // A later plain push still holds it back.
    h.write_local("skills/c.md", "c");
    let push = engine.push(SyncOptions::default());
    assert_eq!(push.pushed_count, 1);
    assert_eq!(std::fs::read_to_string(h.mirror().join("skills/a.md")).unwrap(), "remote");
}

// ===========================================================================
// Busy guard
// ===========================================================================

/// Prompt that tries to start a second operation while the first is running.
struct ReentrantPrompt<'a> {
    engine: &'a SyncEngine,
    nested: RefCell<Option<confsync_core::models::SyncResult>>,
}

impl ConflictPrompt for ReentrantPrompt<'_> {
    fn choose(&self, _record: &ConflictRecord, _merged: Option<&[u8]>) -> Choice {
        assert!(self.engine.is_running());
        *self.nested.borrow_mut() = Some(self.engine.push(SyncOptions::default()));
        Choice::Skip
    }
}

#[test]
fn test_concurrent_operation_is_rejected() {
    let h = Harness::new();
    h.write_local("skills/a.md", "local");
    h.write_mirror("skills/a.md", "remote");

    let engine = h.engine(ConflictStrategy::Ask);
    let prompt = ReentrantPrompt {
        engine: &engine,
        nested: RefCell::new(None),
    };
    let outer = engine.pull(SyncOptions::default(), &prompt);
    assert!(outer.success);

    let nested = prompt.nested.borrow_mut().take().unwrap();
    assert!(!nested.success);
    assert!(nested.errors[0].contains("already in progress"));
    assert!(!engine.is_running());
}
