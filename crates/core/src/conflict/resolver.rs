//! Conflict resolution policy.
//!
//! The [`ConflictResolver`] turns one [`ConflictRecord`] into a final content
//! decision for the active [`ConflictStrategy`]:
//!
//! | Strategy | Decision |
//! |----------|----------|
//! | `local`  | keep local |
//! | `remote` | take remote |
//! | `newest` | side with the later mtime; the available side if only one is known; remote if neither |
//! | `ask`    | delegate to a [`ConflictPrompt`] (`local`, `remote`, `merge` or `skip`) |
//!
//! Every decision either resolves the record with defined content or leaves
//! it explicitly unresolved (`skip`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConflictStrategy;
use crate::models::{ConflictRecord, Side};

/// The decision returned for one conflicting file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    /// Keep the local copy.
    Local,
    /// Take the remote copy.
    Remote,
    /// Use the structured merge result (only offered when one exists).
    Merge,
    /// Leave the file untouched for this pass.
    Skip,
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Merge => write!(f, "merge"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

impl From<Side> for Choice {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => Self::Local,
            Side::Remote => Self::Remote,
        }
    }
}

/// External decision-maker consulted under the `ask` strategy.
///
/// `merged` is the structured merge result when the file is mergeable; an
/// implementation must not return [`Choice::Merge`] when it is `None`.
/// Implementations block until a decision is made.
pub trait ConflictPrompt {
    fn choose(&self, record: &ConflictRecord, merged: Option<&[u8]>) -> Choice;
}

/// Prompt for unattended runs: every conflict is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipPrompt;

impl ConflictPrompt for SkipPrompt {
    fn choose(&self, record: &ConflictRecord, _merged: Option<&[u8]>) -> Choice {
        debug!(path = %record.path, "non-interactive run, skipping conflict");
        Choice::Skip
    }
}

/// Applies the configured strategy to conflict records.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Decide `record` and store the chosen content on it.
    ///
    /// Returns the choice that was applied. A `Merge` choice without merged
    /// content degrades to `Skip`.
    pub fn resolve(
        &self,
        record: &mut ConflictRecord,
        merged: Option<&[u8]>,
        prompt: &dyn ConflictPrompt,
    ) -> Choice {
        let choice = match self.strategy {
            ConflictStrategy::Local => Choice::Local,
            ConflictStrategy::Remote => Choice::Remote,
            ConflictStrategy::Newest => {
                Self::pick_newest(record.local_modified_at, record.remote_modified_at).into()
            }
            ConflictStrategy::Ask => prompt.choose(record, merged),
        };

        let choice = match Self::apply_choice(&record.local_content, &record.remote_content, merged, choice) {
            Some(content) => {
                record.resolve(content);
                choice
            }
            None => {
                if choice == Choice::Merge {
                    warn!(path = %record.path, "merge chosen but no merged content, skipping");
                }
                record.skip();
                Choice::Skip
            }
        };

        info!(
            path = %record.path,
            strategy = %self.strategy,
            choice = %choice,
            "conflict decided"
        );
        choice
    }

    /// Content for a choice: `local` and `remote` are returned verbatim,
    /// `merge` returns the merged content if any, `skip` returns nothing.
    pub fn apply_choice(
        local: &[u8],
        remote: &[u8],
        merged: Option<&[u8]>,
        choice: Choice,
    ) -> Option<Vec<u8>> {
        match choice {
            Choice::Local => Some(local.to_vec()),
            Choice::Remote => Some(remote.to_vec()),
            Choice::Merge => merged.map(<[u8]>::to_vec),
            Choice::Skip => None,
        }
    }

    /// Side with the later timestamp; ties and the no-information case go
    /// to remote.
    pub fn pick_newest(local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> Side {
        match (local, remote) {
            (Some(l), Some(r)) if l > r => Side::Local,
            (Some(_), Some(_)) => Side::Remote,
            (Some(_), None) => Side::Local,
            (None, Some(_)) | (None, None) => Side::Remote,
        }
    }
}
