//! File eligibility and tree scanning.
//!
//! [`FilePolicy`] turns the `[sync.include]` categories, custom patterns and
//! `exclude_patterns` into a per-path decision. [`FsScanner`] walks a tree and
//! applies that policy, producing the candidate set for a push or a backup.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path matches an exclude pattern | `Excluded` |
//! | Path matches an enabled category | `Include(category)` |
//! | Path matches a custom pattern | `Include(Custom)` |
//! | None of the above | `NotIncluded` |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncSection;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// A class of files that can be switched on or off in `[sync.include]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Skills,
    Plugins,
    Settings,
    Projects,
    History,
    Custom,
}

impl Category {
    /// Glob patterns (relative to the tree root) owned by this category.
    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::Skills => &["skills/**"],
            Self::Plugins => &["plugins/**"],
            Self::Settings => &["settings.json", "settings.*.json", "settings/**"],
            Self::Projects => &["projects/**"],
            Self::History => &["history.jsonl", "history/**"],
            Self::Custom => &[],
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skills => write!(f, "skills"),
            Self::Plugins => write!(f, "plugins"),
            Self::Settings => write!(f, "settings"),
            Self::Projects => write!(f, "projects"),
            Self::History => write!(f, "history"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a path against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    /// Path belongs to an enabled category; sync it.
    Include(Category),
    /// Path matches an exclude pattern; skip it.
    Excluded { pattern: String },
    /// Path is not covered by any enabled category or custom pattern.
    NotIncluded,
}

impl FilePolicyDecision {
    /// `true` if the file should be synced.
    pub fn should_sync(&self) -> bool {
        matches!(self, Self::Include(_))
    }
}

// ---------------------------------------------------------------------------
// FilePolicy
// ---------------------------------------------------------------------------

/// Evaluates relative paths against include categories and exclude patterns.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    categories: Vec<Category>,
    custom_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl FilePolicy {
    pub fn new(
        categories: Vec<Category>,
        custom_patterns: Vec<String>,
        exclude_patterns: Vec<String>,
    ) -> Self {
        Self {
            categories,
            custom_patterns,
            exclude_patterns,
        }
    }

    /// Evaluate a path relative to the tree root (`/`-separated).
    pub fn evaluate(&self, rel_path: &str) -> FilePolicyDecision {
        let path = normalize_rel_path(rel_path);

        for pattern in &self.exclude_patterns {
            if matches_pattern(&path, pattern) {
                debug!(path = %path, pattern = pattern.as_str(), "path excluded");
                return FilePolicyDecision::Excluded {
                    pattern: pattern.clone(),
                };
            }
        }

        for category in &self.categories {
            if category.patterns().iter().any(|p| matches_pattern(&path, p)) {
                return FilePolicyDecision::Include(*category);
            }
        }

        if self.custom_patterns.iter().any(|p| matches_pattern(&path, p)) {
            return FilePolicyDecision::Include(Category::Custom);
        }

        FilePolicyDecision::NotIncluded
    }
}

impl From<&SyncSection> for FilePolicy {
    fn from(sync: &SyncSection) -> Self {
        let include = &sync.include;
        let categories = [
            (include.skills, Category::Skills),
            (include.plugins, Category::Plugins),
            (include.settings, Category::Settings),
            (include.projects, Category::Projects),
            (include.history, Category::History),
        ]
        .into_iter()
        .filter_map(|(enabled, category)| enabled.then_some(category))
        .collect();

        Self::new(
            categories,
            include.custom_patterns.clone(),
            sync.exclude_patterns.clone(),
        )
    }
}

/// Test whether `rel_path` matches a glob `pattern` (`*`, `**`, `?`, `{a,b}`).
fn matches_pattern(rel_path: &str, pattern: &str) -> bool {
    let pat = pattern.replace('\\', "/");
    glob_match::glob_match(&pat, rel_path)
}

/// Slash-normalize a relative path and strip any leading `./` or `/`.
pub fn normalize_rel_path(rel_path: &str) -> String {
    let path = rel_path.replace('\\', "/");
    let path = path.trim_start_matches("./");
    path.trim_start_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Result of scanning a tree.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Absolute paths of every eligible file, sorted.
    pub files: Vec<PathBuf>,
    /// Sum of the eligible files' sizes in bytes.
    pub total_size: u64,
    /// Eligible file count per category.
    pub by_category: BTreeMap<Category, usize>,
}

/// Enumerates the files eligible for sync.
pub trait Scanner: Send + Sync {
    /// Root directory the scanner walks.
    fn root(&self) -> &Path;

    /// Walk the root and return every eligible file.
    fn scan(&self) -> std::io::Result<ScanReport>;

    /// Whether a path relative to the root should be synced.
    fn should_sync_file(&self, rel_path: &str) -> bool;
}

/// [`Scanner`] over a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsScanner {
    root: PathBuf,
    policy: FilePolicy,
}

impl FsScanner {
    pub fn new(root: impl Into<PathBuf>, policy: FilePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }
}

impl Scanner for FsScanner {
    fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> std::io::Result<ScanReport> {
        let mut report = ScanReport::default();
        if !self.root.exists() {
            warn!(root = %self.root.display(), "scan root does not exist");
            return Ok(report);
        }

        for rel in walk_tree(&self.root)? {
            if let FilePolicyDecision::Include(category) = self.policy.evaluate(&rel) {
                let abs = self.root.join(&rel);
                let size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);
                report.total_size += size;
                *report.by_category.entry(category).or_insert(0) += 1;
                report.files.push(abs);
            }
        }

        info!(
            root = %self.root.display(),
            files = report.files.len(),
            total_size = report.total_size,
            "scan complete"
        );
        Ok(report)
    }

    fn should_sync_file(&self, rel_path: &str) -> bool {
        self.policy.evaluate(rel_path).should_sync()
    }
}

/// Recursively list every regular file under `root` as sorted, `/`-separated
/// relative paths. A `.git` directory at the root is skipped; unreadable
/// subdirectories are logged and skipped.
pub fn walk_tree(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    walk_inner(root, root, true, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_inner(root: &Path, dir: &Path, is_root: bool, out: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if !is_root => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if is_root && entry.file_name() == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_inner(root, &path, false, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(normalize_rel_path(&rel.to_string_lossy()));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
