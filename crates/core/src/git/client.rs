//! Repository mirror operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use git2::{
    build::CheckoutBuilder, Cred, CredentialType, ErrorCode, FetchOptions, Oid, PushOptions,
    RemoteCallbacks, Repository, RepositoryInitOptions, Signature, Sort, StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::transport::{CommitInfo, Transport, TransportStatus};
use crate::errors::TransportError;

const FALLBACK_NAME: &str = "confsync";
const FALLBACK_EMAIL: &str = "confsync@localhost";
const MAX_AUTH_ATTEMPTS: usize = 3;

/// [`Transport`] backed by a local git checkout that mirrors the remote.
pub struct GitTransport {
    repo: Repository,
    root: PathBuf,
}

impl std::fmt::Debug for GitTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitTransport").field("root", &self.root).finish()
    }
}

impl GitTransport {
    /// Open an existing mirror.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let repo = Repository::open(path)
            .map_err(|_| TransportError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            root: path.to_path_buf(),
        })
    }

    /// Create an empty mirror whose unborn HEAD is `branch` and whose
    /// `origin` points at `url`.
    #[instrument(fields(path = %path.display()))]
    pub fn init(path: &Path, url: &str, branch: &str) -> Result<Self, TransportError> {
        std::fs::create_dir_all(path)?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(branch);
        let repo = Repository::init_opts(path, &opts)?;
        repo.remote("origin", url)?;
        info!("initialised empty mirror");
        Ok(Self {
            repo,
            root: path.to_path_buf(),
        })
    }

    /// Open the mirror at `path`, creating it first if needed. A new mirror
    /// is initialised with `origin` set and fetched; if the remote already
    /// has `branch` it is checked out, otherwise HEAD stays unborn until the
    /// first commit.
    #[instrument(fields(path = %path.display()))]
    pub fn bootstrap(url: &str, branch: &str, path: &Path) -> Result<Self, TransportError> {
        if path.join(".git").exists() {
            let transport = Self::open(path)?;
            let current = transport
                .repo
                .find_remote("origin")
                .ok()
                .and_then(|r| r.url().map(str::to_string));
            match current {
                Some(ref u) if u == url => {}
                Some(_) => {
                    warn!(url, "origin url changed, updating mirror remote");
                    transport.repo.remote_set_url("origin", url)?;
                }
                None => {
                    transport.repo.remote("origin", url)?;
                }
            }
            return Ok(transport);
        }

        let existed = path.exists();
        let transport = Self::init(path, url, branch)?;
        if let Err(e) = transport.fetch("origin") {
            // Leave nothing behind so the next run bootstraps from scratch.
            let leftover = if existed { path.join(".git") } else { path.to_path_buf() };
            if let Err(cleanup) = std::fs::remove_dir_all(&leftover) {
                warn!(path = %leftover.display(), error = %cleanup, "failed to remove partial mirror");
            }
            return Err(TransportError::CloneFailed {
                url: url.to_string(),
                detail: e.to_string(),
            });
        }

        match transport.upstream_oid("origin", branch) {
            Some(fetched) => {
                transport.move_branch(branch, fetched, "confsync: clone")?;
                info!(head = %fetched, "mirror cloned from remote");
            }
            None => info!(url, branch, "remote branch does not exist yet"),
        }
        Ok(transport)
    }

    fn head_oid(&self) -> Result<Option<Oid>, TransportError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upstream_oid(&self, remote: &str, branch: &str) -> Option<Oid> {
        self.repo
            .find_reference(&format!("refs/remotes/{remote}/{branch}"))
            .and_then(|r| r.peel_to_commit())
            .map(|c| c.id())
            .ok()
    }

    fn signature(&self) -> Result<Signature<'static>, TransportError> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
        }
    }

    fn fetch(&self, remote_name: &str) -> Result<(), TransportError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks());
        remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        debug!(remote = remote_name, "fetch completed");
        Ok(())
    }

    /// Point `refs/heads/<branch>` at `target`, make it HEAD and force the
    /// working tree to match.
    fn move_branch(&self, branch: &str, target: Oid, reflog: &str) -> Result<(), TransportError> {
        let refname = format!("refs/heads/{branch}");
        self.repo.reference(&refname, target, true, reflog)?;
        self.repo.set_head(&refname)?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force().remove_untracked(true)))?;
        Ok(())
    }
}

impl Transport for GitTransport {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self))]
    fn pull(&mut self, remote: &str, branch: &str) -> Result<bool, TransportError> {
        let pull_failed = |detail: String| TransportError::PullFailed {
            remote: remote.to_string(),
            branch: branch.to_string(),
            detail,
        };

        self.fetch(remote).map_err(|e| pull_failed(e.to_string()))?;
        let Some(fetched) = self.upstream_oid(remote, branch) else {
            info!("remote branch is empty, nothing to pull");
            return Ok(false);
        };

        match self.head_oid()? {
            Some(head) if head == fetched => {
                debug!("mirror already up to date");
                return Ok(false);
            }
            Some(head) if self.repo.graph_descendant_of(head, fetched)? => {
                debug!("mirror is ahead of remote");
                return Ok(false);
            }
            Some(head) if !self.repo.graph_descendant_of(fetched, head)? => {
                warn!(head = %head, remote_head = %fetched, "mirror diverged from remote, resetting to remote");
            }
            _ => {}
        }

        self.move_branch(branch, fetched, "confsync: pull")
            .map_err(|e| pull_failed(e.to_string()))?;
        info!(head = %fetched, "pull completed");
        Ok(true)
    }

    #[instrument(skip(self))]
    fn push(&mut self, remote: &str, branch: &str, force: bool) -> Result<(), TransportError> {
        if self.head_oid()?.is_none() {
            debug!("nothing committed, skipping push");
            return Ok(());
        }

        let mut git_remote = self.repo.find_remote(remote)?;
        let mut callbacks = remote_callbacks();
        let rejection = Arc::new(Mutex::new(None::<String>));
        let rejection_slot = Arc::clone(&rejection);
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = rejection_slot.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let prefix = if force { "+" } else { "" };
        let refspec = format!("{prefix}refs/heads/{branch}:refs/heads/{branch}");
        git_remote
            .push(&[refspec.as_str()], Some(&mut push_opts))
            .map_err(|e| TransportError::PushRejected {
                branch: branch.to_string(),
                detail: e.message().to_string(),
            })?;

        let rejected = rejection.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detail) = rejected {
            return Err(TransportError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }

        // Keep the remote-tracking ref in step so ahead/behind stays accurate.
        if let Some(head) = self.head_oid()? {
            self.repo.reference(
                &format!("refs/remotes/{remote}/{branch}"),
                head,
                true,
                "confsync: push",
            )?;
        }
        info!(force, "push completed");
        Ok(())
    }

    fn add(&mut self, paths: &[String]) -> Result<(), TransportError> {
        let mut index = self.repo.index()?;
        for rel in paths {
            let rel_path = Path::new(rel);
            if self.root.join(rel_path).exists() {
                index.add_path(rel_path)?;
            } else {
                index.remove_path(rel_path)?;
            }
        }
        index.write()?;
        debug!(count = paths.len(), "staged paths");
        Ok(())
    }

    #[instrument(skip(self, message))]
    fn commit(&mut self, message: &str) -> Result<Option<String>, TransportError> {
        let mut index = self.repo.index()?;
        let tree_oid = index.write_tree()?;
        let parent = match self.head_oid()? {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };

        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_oid,
            None => index.is_empty(),
        };
        if unchanged {
            debug!("index matches HEAD, no commit created");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid.to_string()))
    }

    fn has_changes(&self) -> Result<bool, TransportError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .any(|e| !e.status().is_empty() && !e.status().is_ignored()))
    }

    fn status(&self) -> Result<TransportStatus, TransportError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut status = TransportStatus::default();
        for entry in statuses.iter() {
            let s = entry.status();
            if s.is_conflicted() {
                status.conflicted += 1;
            }
            if s.is_index_new()
                || s.is_index_modified()
                || s.is_index_deleted()
                || s.is_index_renamed()
                || s.is_index_typechange()
            {
                status.staged += 1;
            }
            if s.is_wt_new() {
                status.untracked += 1;
            }
        }

        let branch = self
            .repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(str::to_string));
        if let (Some(head), Some(branch)) = (self.head_oid()?, branch) {
            match self.upstream_oid("origin", &branch) {
                Some(upstream) => {
                    let (ahead, behind) = self.repo.graph_ahead_behind(head, upstream)?;
                    status.ahead = ahead;
                    status.behind = behind;
                }
                None => {
                    let mut revwalk = self.repo.revwalk()?;
                    revwalk.push(head)?;
                    status.ahead = revwalk.count();
                }
            }
        }
        Ok(status)
    }

    fn log(&self, n: usize) -> Result<Vec<CommitInfo>, TransportError> {
        let Some(head) = self.head_oid()? else {
            return Ok(Vec::new());
        };
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(head)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in revwalk.take(n) {
            let commit = self.repo.find_commit(oid?)?;
            let author = commit.author();
            commits.push(CommitInfo {
                hash: commit.id().to_string(),
                author: author.name().unwrap_or("").to_string(),
                message: commit.message().unwrap_or("").to_string(),
                date: DateTime::<Utc>::from_timestamp(author.when().seconds(), 0).unwrap_or_default(),
            });
        }
        Ok(commits)
    }

    fn head_id(&self) -> Result<Option<String>, TransportError> {
        Ok(self.head_oid()?.map(|oid| oid.to_string()))
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, TransportError> {
        let (a, b) = (Oid::from_str(a)?, Oid::from_str(b)?);
        match self.repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_file_at(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let oid = Oid::from_str(commit)?;
        let tree = self.repo.find_commit(oid)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
        Ok(Some(blob.content().to_vec()))
    }
}

/// Credentials from the ssh agent or the configured git credential helper.
fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |url, username, allowed| {
        attempts += 1;
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Ok(config) = git2::Config::open_default() {
                return Cred::credential_helper(&config, url, username);
            }
        }
        Cred::default()
    });
    callbacks
}
