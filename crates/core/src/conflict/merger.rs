//! Structured deep-merge engine.
//!
//! Merges two (or, with a common ancestor, three) versions of a structured
//! value and reports every key path it could not settle without a judgment
//! call. Conflicting leaves are tentatively filled from the side the active
//! [`ConflictStrategy`] favours: `local` keeps local, every other strategy
//! keeps remote until the resolution policy decides.
//!
//! Lists are merged pairwise by position, not by content-aware diffing. Two
//! lists that differ only by an inserted element therefore conflict at every
//! shifted index.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::ConflictStrategy;
use crate::conflict::value::{Node, Primitive};
use crate::errors::MergeError;
use crate::models::Side;

/// Key path reported when the whole document conflicts.
pub const ROOT_KEY: &str = "$";

/// The result of a merge attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Merged value, or `None` when the content is not structured.
    pub result: Option<Node>,
    /// Dot-paths that differ on both sides, in traversal order.
    pub conflicting_keys: Vec<String>,
    /// `true` iff `conflicting_keys` is empty.
    pub merged: bool,
}

impl MergeOutcome {
    fn structured(result: Node, conflicting_keys: Vec<String>) -> Self {
        Self {
            merged: conflicting_keys.is_empty(),
            result: Some(result),
            conflicting_keys,
        }
    }

    /// Outcome for content that cannot be merged structurally.
    pub fn opaque() -> Self {
        Self {
            result: None,
            conflicting_keys: vec![ROOT_KEY.to_string()],
            merged: false,
        }
    }
}

/// A merge over raw file bytes.
#[derive(Debug, Clone)]
pub struct ContentMerge {
    pub outcome: MergeOutcome,
    /// Serialized merged content. Reuses one side's original bytes when the
    /// merged value equals that side, so formatting is preserved.
    pub content: Option<Vec<u8>>,
}

impl ContentMerge {
    fn opaque() -> Self {
        Self {
            outcome: MergeOutcome::opaque(),
            content: None,
        }
    }

    /// Whether the content was structured and merged without conflicts.
    pub fn is_clean(&self) -> bool {
        self.outcome.merged && self.content.is_some()
    }
}

/// Stateless apart from the strategy used for tentative picks.
#[derive(Debug, Clone, Copy)]
pub struct Merger {
    strategy: ConflictStrategy,
}

impl Merger {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Whether a path's content type is eligible for structured merging.
    pub fn can_merge(path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    /// Side used to fill a conflicting leaf until the policy decides.
    fn tentative_side(&self) -> Side {
        match self.strategy {
            ConflictStrategy::Local => Side::Local,
            ConflictStrategy::Remote | ConflictStrategy::Ask | ConflictStrategy::Newest => {
                Side::Remote
            }
        }
    }

    // -----------------------------------------------------------------------
    // Two-way merge
    // -----------------------------------------------------------------------

    /// Merge `local` and `remote` without a common ancestor.
    ///
    /// A key present on only one side is taken as-is; a key present on both
    /// sides recurses; unequal leaves and container/primitive mismatches are
    /// conflicts.
    pub fn merge(&self, local: &Node, remote: &Node) -> MergeOutcome {
        let mut keys = Vec::new();
        let result = self.merge2_node("", local, remote, &mut keys);
        debug!(conflicts = keys.len(), "two-way merge finished");
        MergeOutcome::structured(result, keys)
    }

    fn merge2_node(&self, path: &str, local: &Node, remote: &Node, keys: &mut Vec<String>) -> Node {
        match (local, remote) {
            (Node::Mapping(l), Node::Mapping(r)) => {
                let mut out = BTreeMap::new();
                for (key, lv) in l {
                    let merged = match r.get(key) {
                        Some(rv) => self.merge2_node(&child_path(path, key), lv, rv, keys),
                        None => lv.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
                for (key, rv) in r {
                    if !l.contains_key(key) {
                        out.insert(key.clone(), rv.clone());
                    }
                }
                Node::Mapping(out)
            }
            (Node::List(l), Node::List(r)) => {
                let len = l.len().max(r.len());
                let items = (0..len)
                    .filter_map(|i| match (l.get(i), r.get(i)) {
                        (Some(lv), Some(rv)) => {
                            Some(self.merge2_node(&child_path(path, &i.to_string()), lv, rv, keys))
                        }
                        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
                        (None, None) => None,
                    })
                    .collect();
                Node::List(items)
            }
            _ if local == remote => local.clone(),
            _ => {
                keys.push(report_path(path));
                self.pick(local, remote).clone()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Three-way merge
    // -----------------------------------------------------------------------

    /// Merge `local` and `remote` against their common ancestor `base`.
    ///
    /// A leaf changed on only one side takes that side's value; only leaves
    /// changed differently on both sides conflict. A key removed on one side
    /// and untouched on the other stays removed.
    pub fn merge3(&self, base: &Node, local: &Node, remote: &Node) -> MergeOutcome {
        let mut keys = Vec::new();
        let result = self
            .merge3_node("", Some(base), Some(local), Some(remote), &mut keys)
            .unwrap_or(Node::Primitive(Primitive::Null));
        debug!(conflicts = keys.len(), "three-way merge finished");
        MergeOutcome::structured(result, keys)
    }

    fn merge3_node(
        &self,
        path: &str,
        base: Option<&Node>,
        local: Option<&Node>,
        remote: Option<&Node>,
        keys: &mut Vec<String>,
    ) -> Option<Node> {
        if local == remote {
            return local.cloned();
        }
        if base == local {
            return remote.cloned();
        }
        if base == remote {
            return local.cloned();
        }

        match (local, remote) {
            (Some(Node::Mapping(l)), Some(Node::Mapping(r))) => {
                let b = match base {
                    Some(Node::Mapping(b)) => Some(b),
                    _ => None,
                };
                let mut out = BTreeMap::new();
                let union = l.keys().chain(r.keys().filter(|k| !l.contains_key(*k)));
                for key in union {
                    let merged = self.merge3_node(
                        &child_path(path, key),
                        b.and_then(|b| b.get(key)),
                        l.get(key),
                        r.get(key),
                        keys,
                    );
                    if let Some(value) = merged {
                        out.insert(key.clone(), value);
                    }
                }
                Some(Node::Mapping(out))
            }
            (Some(Node::List(l)), Some(Node::List(r))) => {
                let b = match base {
                    Some(Node::List(b)) => Some(b),
                    _ => None,
                };
                let len = l.len().max(r.len());
                let items = (0..len)
                    .filter_map(|i| {
                        self.merge3_node(
                            &child_path(path, &i.to_string()),
                            b.and_then(|b| b.get(i)),
                            l.get(i),
                            r.get(i),
                            keys,
                        )
                    })
                    .collect();
                Some(Node::List(items))
            }
            _ => {
                keys.push(report_path(path));
                match self.tentative_side() {
                    Side::Local => local.cloned(),
                    Side::Remote => remote.cloned(),
                }
            }
        }
    }

    fn pick<'a>(&self, local: &'a Node, remote: &'a Node) -> &'a Node {
        match self.tentative_side() {
            Side::Local => local,
            Side::Remote => remote,
        }
    }

    // -----------------------------------------------------------------------
    // Byte-level entry point
    // -----------------------------------------------------------------------

    /// Merge two file contents, using `base` when it parses.
    ///
    /// Non-mergeable paths and unparseable content never fail: they come back
    /// as an opaque outcome with no merged content.
    pub fn merge_contents(
        &self,
        path: &str,
        local: &[u8],
        remote: &[u8],
        base: Option<&[u8]>,
    ) -> ContentMerge {
        if !Self::can_merge(path) {
            debug!(path, "not structurally mergeable");
            return ContentMerge::opaque();
        }

        let parsed = parse_side(path, "local", local)
            .and_then(|l| parse_side(path, "remote", remote).map(|r| (l, r)));
        let (local_node, remote_node) = match parsed {
            Ok(pair) => pair,
            Err(e) => {
                warn!(path, error = %e, "structured parse failed, treating as opaque");
                return ContentMerge::opaque();
            }
        };

        let base_node = base.and_then(|b| match parse_side(path, "base", b) {
            Ok(node) => Some(node),
            Err(e) => {
                debug!(path, error = %e, "base unparseable, falling back to two-way merge");
                None
            }
        });

        let outcome = match &base_node {
            Some(b) => self.merge3(b, &local_node, &remote_node),
            None => self.merge(&local_node, &remote_node),
        };

        let content = match &outcome.result {
            Some(node) if *node == local_node => Some(local.to_vec()),
            Some(node) if *node == remote_node => Some(remote.to_vec()),
            Some(node) => match node.to_json_vec() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    let err = MergeError::SerializeFailed {
                        path: path.to_string(),
                        detail: e.to_string(),
                    };
                    warn!(error = %err, "treating as opaque");
                    return ContentMerge::opaque();
                }
            },
            None => None,
        };

        ContentMerge { outcome, content }
    }
}

fn parse_side(path: &str, side: &'static str, bytes: &[u8]) -> Result<Node, MergeError> {
    Node::from_json_slice(bytes).map_err(|e| MergeError::Unparseable {
        path: path.to_string(),
        side,
        detail: e.to_string(),
    })
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn report_path(path: &str) -> String {
    if path.is_empty() {
        ROOT_KEY.to_string()
    } else {
        path.to_string()
    }
}
