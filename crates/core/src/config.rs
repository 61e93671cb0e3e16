//! Configuration for confsync.
//!
//! The configuration record is a human-editable TOML file. It names the
//! shared repository, which categories of files to sync, how conflicts are
//! resolved, and where the local tree and the mirror/backup data live.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// The only configuration schema version understood by this build.
pub const CONFIG_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Schema version (currently always 1).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Repository, branch, filters and conflict strategy.
    pub sync: SyncSection,

    /// Local tree and data directory locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Safety snapshot retention.
    #[serde(default)]
    pub backup: BackupConfig,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

// ---------------------------------------------------------------------------
// [sync]
// ---------------------------------------------------------------------------

/// The `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Remote repository URL (any URL `git` understands, including local paths).
    pub repository: String,

    /// Branch to pull from and push to.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Whether the daemon syncs on an interval and on file changes.
    #[serde(default)]
    pub auto_sync: bool,

    /// Minutes between scheduled syncs when `auto_sync` is on.
    #[serde(default = "default_interval")]
    pub sync_interval_minutes: u32,

    /// Glob patterns (relative, `/`-separated) that are never synced.
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// How diverging files are resolved.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Which categories of files are eligible for sync.
    #[serde(default)]
    pub include: IncludeConfig,
}

fn default_branch() -> String {
    "main".into()
}

fn default_interval() -> u32 {
    30
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["**/*.log".into(), "**/.DS_Store".into(), "**/node_modules/**".into()]
}

/// The `[sync.include]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeConfig {
    #[serde(default = "default_true")]
    pub skills: bool,
    #[serde(default = "default_true")]
    pub plugins: bool,
    #[serde(default = "default_true")]
    pub settings: bool,
    #[serde(default)]
    pub projects: bool,
    #[serde(default)]
    pub history: bool,
    /// Extra glob patterns to include on top of the categories.
    #[serde(default)]
    pub custom_patterns: Vec<String>,
}

impl Default for IncludeConfig {
    fn default() -> Self {
        Self {
            skills: true,
            plugins: true,
            settings: true,
            projects: false,
            history: false,
            custom_patterns: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Conflict strategy
// ---------------------------------------------------------------------------

/// How a file whose local and remote copies diverge is resolved.
///
/// Read once when the sync engine is constructed and immutable for the run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Ask an external decision-maker for every conflicting file.
    #[default]
    Ask,
    /// Always keep the local copy.
    Local,
    /// Always take the remote copy.
    Remote,
    /// Take whichever side was modified last.
    Newest,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [Self::Ask, Self::Local, Self::Remote, Self::Newest];
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Newest => write!(f, "newest"),
        }
    }
}

// ---------------------------------------------------------------------------
// [paths] and [backup]
// ---------------------------------------------------------------------------

/// The `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the tree being synced.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// Directory holding the repository mirror, backups and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            data_dir: default_data_dir(),
        }
    }
}

impl PathsConfig {
    /// Local on-disk clone of the remote repository.
    pub fn mirror_dir(&self) -> PathBuf {
        self.data_dir.join("repo")
    }

    /// Directory holding safety snapshots.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Directory for daemon log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("~/.config/confsync/tree")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.local/share/confsync")
}

/// The `[backup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Number of snapshots kept; older ones are evicted first.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
        }
    }
}

fn default_max_snapshots() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Loading, saving & validation
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Build a config for `repository` with every other field defaulted.
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            version: CONFIG_VERSION,
            sync: SyncSection {
                repository: repository.into(),
                branch: default_branch(),
                auto_sync: false,
                sync_interval_minutes: default_interval(),
                exclude_patterns: default_exclude_patterns(),
                conflict_strategy: ConflictStrategy::default(),
                include: IncludeConfig::default(),
            },
            paths: PathsConfig::default(),
            backup: BackupConfig::default(),
        }
    }

    /// Default location of the config file (`<config dir>/confsync/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("confsync")
            .join("config.toml")
    }

    /// Load a [`SyncConfig`] from a TOML file and expand `~` in its paths.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.paths.local_root = expand_tilde(&config.paths.local_root);
        config.paths.data_dir = expand_tilde(&config.paths.data_dir);

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Write the config to `path` as TOML, creating parent directories.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, contents)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::InvalidValue {
                field: "version".into(),
                detail: format!("unsupported version {} (expected {CONFIG_VERSION})", self.version),
            });
        }
        if self.sync.repository.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.repository".into(),
                detail: "repository must not be empty".into(),
            });
        }
        if self.sync.branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if self.sync.sync_interval_minutes < 1 {
            return Err(ConfigError::InvalidValue {
                field: "sync.sync_interval_minutes".into(),
                detail: "sync interval must be >= 1".into(),
            });
        }
        if self.backup.max_snapshots < 1 {
            return Err(ConfigError::InvalidValue {
                field: "backup.max_snapshots".into(),
                detail: "at least one snapshot must be kept".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# confsync configuration
version = 1

[sync]
repository = "git@github.com:you/config-sync.git"
branch = "main"
auto_sync = false
sync_interval_minutes = 30
exclude_patterns = ["**/*.log", "**/.DS_Store", "**/node_modules/**"]
# ask | local | remote | newest
conflict_strategy = "ask"

[sync.include]
skills = true
plugins = true
settings = true
projects = false
history = false
custom_patterns = []

[paths]
local_root = "~/.config/confsync/tree"
data_dir = "~/.local/share/confsync"

[backup]
max_snapshots = 10
"#
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
version = 1

[sync]
repository = "/srv/git/config.git"
branch = "trunk"
auto_sync = true
sync_interval_minutes = 5
exclude_patterns = ["**/*.tmp"]
conflict_strategy = "newest"

[sync.include]
skills = false
history = true
custom_patterns = ["notes/**"]

[paths]
local_root = "/tmp/confsync-tree"
data_dir = "/tmp/confsync-data"

[backup]
max_snapshots = 3
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: SyncConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.sync.repository, "/srv/git/config.git");
        assert_eq!(config.sync.branch, "trunk");
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.sync_interval_minutes, 5);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::Newest);
        assert!(!config.sync.include.skills);
        assert!(config.sync.include.plugins);
        assert!(config.sync.include.history);
        assert_eq!(config.sync.include.custom_patterns, vec!["notes/**"]);
        assert_eq!(config.backup.max_snapshots, 3);
        assert_eq!(config.paths.mirror_dir(), PathBuf::from("/tmp/confsync-data/repo"));
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: SyncConfig = toml::from_str("[sync]\nrepository = \"r\"\n").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.sync.branch, "main");
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::Ask);
        assert_eq!(config.sync.sync_interval_minutes, 30);
        assert_eq!(config.backup.max_snapshots, 10);
        assert!(config.sync.exclude_patterns.contains(&"**/*.log".to_string()));
    }

    #[test]
    fn test_unknown_strategy_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nrepository = \"r\"\nconflict_strategy = \"coinflip\"\n")
            .unwrap();
        let result = SyncConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_file_not_found() {
        let result = SyncConfig::load_from_file("/nonexistent/confsync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_repository() {
        let config = SyncConfig::new("  ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.repository"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_branch() {
        let mut config = SyncConfig::new("repo");
        config.sync.branch = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.branch"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = SyncConfig::new("repo");
        config.sync.sync_interval_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = SyncConfig::new("repo");
        config.backup.max_snapshots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_display_matches_config_names() {
        for strategy in ConflictStrategy::ALL {
            let toml = format!("[sync]\nrepository = \"r\"\nconflict_strategy = \"{strategy}\"\n");
            let config: SyncConfig = toml::from_str(&toml).unwrap();
            assert_eq!(config.sync.conflict_strategy, strategy);
        }
        let bad = "[sync]\nrepository = \"r\"\nconflict_strategy = \"coinflip\"\n";
        assert!(toml::from_str::<SyncConfig>(bad).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = SyncConfig::new("https://example.com/cfg.git");
        config.sync.conflict_strategy = ConflictStrategy::Remote;
        config.paths.local_root = dir.path().join("tree");
        config.save_to_file(&path).unwrap();

        let loaded = SyncConfig::load_and_validate(&path).unwrap();
        assert_eq!(loaded.sync.repository, "https://example.com/cfg.git");
        assert_eq!(loaded.sync.conflict_strategy, ConflictStrategy::Remote);
        assert_eq!(loaded.paths.local_root, dir.path().join("tree"));
    }

    #[test]
    fn test_expand_tilde() {
        let plain = PathBuf::from("/abs/path");
        assert_eq!(expand_tilde(&plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        }
    }

    #[test]
    fn test_default_template_is_valid() {
        let config: SyncConfig = toml::from_str(SyncConfig::default_template())
            .expect("default template should be valid TOML");
        config.validate().unwrap();
    }
}
