//! confsync command-line tool.
//!
//! Provides subcommands to pull, push and sync a configuration tree with
//! its git remote, inspect the mirror, manage safety snapshots, and
//! generate / validate the configuration file.

mod prompt;
mod render;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use confsync_core::backup::BackupManager;
use confsync_core::config::{expand_tilde, ConflictStrategy, SyncConfig};
use confsync_core::conflict::{ConflictPrompt, SkipPrompt};
use confsync_core::sync_engine::{SyncEngine, SyncOptions};

use prompt::TerminalPrompt;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Keep a configuration tree in sync with a git remote.
#[derive(Parser, Debug)]
#[command(name = "confsync", version, about = "Sync a configuration tree with a git remote")]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: <config dir>/confsync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy local changes to the remote.
    Push {
        /// Show what would be pushed without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Overwrite the remote branch.
        #[arg(long)]
        force: bool,
    },

    /// Bring remote changes into the local tree.
    Pull {
        /// Show what would be pulled without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Take the remote side of every conflict.
        #[arg(long)]
        force: bool,
    },

    /// Pull, then push.
    Sync {
        /// Show what would change without changing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show mirror status, pending conflicts and the latest snapshot.
    Status,

    /// Show recent sync commits.
    Log {
        /// Number of commits to show.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Manage safety snapshots of the local tree.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Create a configuration file.
    Init {
        /// Remote repository URL (prompted for when omitted).
        #[arg(short, long)]
        repository: Option<String>,

        /// Overwrite an existing file without asking.
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// List snapshots, newest first.
    List,
    /// Take a snapshot now.
    Create,
    /// Restore a snapshot (a safety snapshot is taken first).
    Restore {
        /// Snapshot ID (or unique prefix).
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(SyncConfig::default_path);
    let config_path = expand_tilde(&config_path);

    match cli.command {
        Commands::Init { repository, force } => cmd_init(&config_path, repository, force),
        Commands::Validate => cmd_validate(&config_path),
        Commands::Backup { action } => {
            let config = load_config(&config_path)?;
            cmd_backup(&BackupManager::from_config(&config), action)
        }
        Commands::Push { dry_run, force } => {
            let engine = open_engine(&config_path)?;
            let options = SyncOptions {
                dry_run,
                force,
                ..Default::default()
            };
            let spinner = spinner("Pushing...");
            let result = engine.push(options);
            spinner.finish_and_clear();
            render::sync_result(&result);
            Ok(())
        }
        Commands::Pull { dry_run, force } => {
            let engine = open_engine(&config_path)?;
            let options = SyncOptions {
                dry_run,
                force,
                ..Default::default()
            };
            let result = engine.pull(options, conflict_prompt(&engine).as_ref());
            render::sync_result(&result);
            Ok(())
        }
        Commands::Sync { dry_run } => {
            let engine = open_engine(&config_path)?;
            let options = SyncOptions {
                dry_run,
                ..Default::default()
            };
            let result = engine.sync(options, conflict_prompt(&engine).as_ref());
            render::sync_result(&result);
            Ok(())
        }
        Commands::Status => {
            let engine = open_engine(&config_path)?;
            cmd_status(&engine)
        }
        Commands::Log { limit } => {
            let engine = open_engine(&config_path)?;
            let commits = engine.log(limit).context("failed to read mirror history")?;
            println!();
            println!("{}", style::header(&format!("Sync History (last {limit})")));
            render::commits(&commits);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<SyncConfig> {
    SyncConfig::load_and_validate(path).with_context(|| {
        format!(
            "failed to load configuration from {} (run 'confsync init' to create one)",
            path.display()
        )
    })
}

fn open_engine(config_path: &Path) -> Result<SyncEngine> {
    let config = load_config(config_path)?;
    debug!(
        config = %config_path.display(),
        repository = %config.sync.repository,
        "opening sync engine"
    );
    SyncEngine::from_config(config).context("failed to open repository mirror")
}

/// The terminal prompt when attached to a terminal, otherwise skip every
/// conflict.
fn conflict_prompt(engine: &SyncEngine) -> Box<dyn ConflictPrompt> {
    if engine.config().sync.conflict_strategy == ConflictStrategy::Ask && !TerminalPrompt::available() {
        eprintln!(
            "{}",
            style::warn("not attached to a terminal; conflicts will be skipped")
        );
        return Box::new(SkipPrompt);
    }
    Box::new(TerminalPrompt)
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template = ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(template.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path, repository: Option<String>, force: bool) -> Result<()> {
    if output.exists() && !force {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !overwrite {
            println!("Aborted.");
            return Ok(());
        }
    }

    let repository = match repository {
        Some(r) => r,
        None => Input::<String>::new()
            .with_prompt("Remote repository URL")
            .interact_text()
            .context("failed to read repository URL")?,
    };

    let mut config = SyncConfig::new(repository);
    if !force {
        let labels: Vec<String> = ConflictStrategy::ALL.iter().map(|s| s.to_string()).collect();
        let picked = Select::new()
            .with_prompt("Conflict strategy")
            .items(&labels)
            .default(0)
            .interact()
            .context("failed to read conflict strategy")?;
        config.sync.conflict_strategy = ConflictStrategy::ALL[picked];
    }
    config.validate().context("generated configuration is invalid")?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    config
        .save_to_file(output)
        .context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Review include/exclude rules in the config file");
    println!("  2. Validate with: confsync validate --config {}", output.display());
    println!("  3. Run the first sync: confsync sync");
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = SyncConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let include = &config.sync.include;
    let enabled: Vec<&str> = [
        ("skills", include.skills),
        ("plugins", include.plugins),
        ("settings", include.settings),
        ("projects", include.projects),
        ("history", include.history),
    ]
    .into_iter()
    .filter_map(|(name, on)| on.then_some(name))
    .collect();

    println!();
    println!("Configuration summary:");
    println!("  Repository    : {}", config.sync.repository);
    println!("  Branch        : {}", config.sync.branch);
    println!("  Strategy      : {}", config.sync.conflict_strategy);
    println!(
        "  Auto sync     : {}",
        if config.sync.auto_sync {
            format!("every {} min", config.sync.sync_interval_minutes)
        } else {
            "off".to_string()
        }
    );
    println!("  Categories    : {}", enabled.join(", "));
    println!("  Custom globs  : {}", config.sync.include.custom_patterns.len());
    println!("  Exclusions    : {}", config.sync.exclude_patterns.len());
    println!("  Local tree    : {}", config.paths.local_root.display());
    println!("  Data directory: {}", config.paths.data_dir.display());
    println!("  Snapshots kept: {}", config.backup.max_snapshots);
    println!();
    println!("Configuration is valid.");
    Ok(())
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let config = engine.config();
    println!();
    println!("{}", style::header("confsync"));
    println!("{}", "═".repeat(8));
    println!();
    println!("  Remote     {} ({})", config.sync.repository, config.sync.branch);
    println!("  Strategy   {}", config.sync.conflict_strategy);
    println!("  Local tree {}", expand_tilde(&config.paths.local_root).display());
    println!();

    let status = engine.status().context("failed to read mirror status")?;
    render::transport_status(&status);

    let pending = engine.pending_conflicts();
    if !pending.is_empty() {
        println!();
        println!("{}", style::header(&format!("Unresolved Conflicts ({})", pending.len())));
        for path in &pending {
            println!("  {}", style::warn(path));
        }
    }

    println!();
    match engine.backups().list_snapshots()?.first() {
        Some(latest) => println!(
            "  Last snapshot {} {}",
            latest.id,
            style::dim(&format!("({} files)", latest.files.len()))
        ),
        None => println!("  {}", style::dim("No snapshots yet.")),
    }
    println!();
    Ok(())
}

fn cmd_backup(backups: &BackupManager, action: BackupAction) -> Result<()> {
    match action {
        BackupAction::List => {
            let snapshots = backups.list_snapshots().context("failed to list snapshots")?;
            println!();
            println!("{}", style::header(&format!("Snapshots ({})", snapshots.len())));
            render::snapshots(&snapshots);
        }
        BackupAction::Create => {
            let spinner = spinner("Taking snapshot...");
            let snapshot = backups.create_snapshot();
            spinner.finish_and_clear();
            let snapshot = snapshot.context("failed to create snapshot")?;
            println!(
                "{}",
                style::success(&format!("Snapshot {} ({} files)", snapshot.id, snapshot.files.len()))
            );
        }
        BackupAction::Restore { id } => {
            let (safety, report) = backups
                .restore_with_safety(&id)
                .with_context(|| format!("failed to restore snapshot {id}"))?;
            println!("{}", style::dim(&format!("Safety snapshot {} taken first", safety.id)));
            if report.is_complete() {
                println!("{}", style::success(&format!("Restored {} file(s)", report.restored)));
            } else {
                println!(
                    "{}",
                    style::warn(&format!(
                        "Restored {} file(s), {} failed",
                        report.restored,
                        report.errors.len()
                    ))
                );
                for e in &report.errors {
                    println!("  {}", style::error(e));
                }
            }
        }
    }
    Ok(())
}
