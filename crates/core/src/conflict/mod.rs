//! Conflict detection, structured merging, and resolution policy.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- comparing the local tree with the repository mirror.
//! 2. **Merging** -- deep-merging structured (JSON) files, two- or three-way.
//! 3. **Resolution** -- applying the configured strategy to what remains.

pub mod detector;
pub mod merger;
pub mod resolver;
pub mod value;

pub use detector::{ConflictDetector, Detection, FileChange};
pub use merger::{ContentMerge, MergeOutcome, Merger};
pub use resolver::{Choice, ConflictPrompt, ConflictResolver, SkipPrompt};
pub use value::{Node, Primitive};
