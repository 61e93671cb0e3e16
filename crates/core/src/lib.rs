//! confsync core library.
//!
//! This crate provides the building blocks for keeping a configuration tree
//! in sync with a git remote: configuration, the structured merge engine,
//! conflict resolution policy, safety snapshots, the git transport, and the
//! sync engine that sequences them.

pub mod backup;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod models;
pub mod scanner;
pub mod sync_engine;

// Re-exports for convenience.
pub use backup::{BackupManager, SnapshotInfo};
pub use config::{ConflictStrategy, SyncConfig};
pub use conflict::{Choice, ConflictPrompt, Merger, SkipPrompt};
pub use errors::CoreError;
pub use git::{GitTransport, Transport};
pub use models::{ConflictRecord, SyncResult};
pub use sync_engine::{SyncEngine, SyncOptions};
