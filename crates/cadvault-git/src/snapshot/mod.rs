//! Local working copy of the shared repository.
//!
//! A snapshot mirrors the remote branch before every operation and publishes
//! changes as a single commit pushed without forcing. When a publish fails
//! the working copy is rolled back to the last tip the remote acknowledged,
//! so a failed operation never leaves local state ahead of the remote.

mod transport;

pub use transport::{configure_network_timeouts, Git2Transport, RemoteTransport, REMOTE_NAME};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use cadvault_core::convention::{self, CommitSubject};
use cadvault_core::{CommitEvent, Identity, VaultError};
use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{Commit, DiffOptions, ErrorCode, Oid, Repository, ResetType, Signature, Sort};
use globset::Glob;
use tracing::{debug, info, instrument, warn};

use crate::paths;

fn git_err(context: &str, e: git2::Error) -> VaultError {
    VaultError::Git(format!("Failed to {}: {}", context, e))
}

/// A tracked file as seen in the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

pub struct RepositorySnapshot {
    repo: Repository,
    workdir: PathBuf,
    branch: String,
    transport: Box<dyn RemoteTransport>,
    /// Last tip the remote acknowledged (`None` while the branch is unborn)
    known_good: Option<Oid>,
    /// Past this instant nothing more is fetched or pushed
    deadline: Option<Instant>,
}

impl std::fmt::Debug for RepositorySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositorySnapshot")
            .field("workdir", &self.workdir)
            .field("branch", &self.branch)
            .field("known_good", &self.known_good)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl RepositorySnapshot {
    /// Open the working copy at `work_dir`, creating it if needed.
    ///
    /// Does not contact the remote; call [`ensure_up_to_date`](Self::ensure_up_to_date)
    /// before reading.
    pub fn open(
        work_dir: impl AsRef<Path>,
        remote_url: &str,
        branch: &str,
        transport: Box<dyn RemoteTransport>,
    ) -> Result<Self, VaultError> {
        let workdir = work_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&workdir).map_err(|e| {
            VaultError::Io(format!(
                "Failed to create work dir {}: {}",
                workdir.display(),
                e
            ))
        })?;

        let repo = match Repository::open(&workdir) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                info!("Initializing working copy at {}", workdir.display());
                Repository::init(&workdir).map_err(|e| git_err("init working copy", e))?
            }
            Err(e) => return Err(git_err("open working copy", e)),
        };

        let current_url = match repo.find_remote(REMOTE_NAME) {
            Ok(remote) => Some(remote.url().unwrap_or_default().to_string()),
            Err(_) => None,
        };
        match current_url {
            None => {
                repo.remote(REMOTE_NAME, remote_url)
                    .map_err(|e| git_err("add remote", e))?;
            }
            Some(url) if url != remote_url => {
                info!("Remote URL changed, updating {} -> {}", url, remote_url);
                repo.remote_set_url(REMOTE_NAME, remote_url)
                    .map_err(|e| git_err("update remote url", e))?;
            }
            Some(_) => {}
        }

        repo.set_head(&format!("refs/heads/{}", branch))
            .map_err(|e| git_err("set HEAD", e))?;

        let mut snapshot = Self {
            repo,
            workdir,
            branch: branch.to_string(),
            transport,
            known_good: None,
            deadline: None,
        };
        snapshot.known_good = snapshot.lookup(&snapshot.tracking_ref())?;
        Ok(snapshot)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Id of the last tip acknowledged by the remote.
    pub fn tip_id(&self) -> Option<String> {
        self.known_good.map(|oid| oid.to_string())
    }

    /// Bound the network work of the current operation; `None` lifts the bound.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn check_deadline(&self, stage: &str) -> Result<(), VaultError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(VaultError::Sync(format!(
                "operation deadline passed before {}",
                stage
            ))),
            _ => Ok(()),
        }
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", REMOTE_NAME, self.branch)
    }

    fn lookup(&self, name: &str) -> Result<Option<Oid>, VaultError> {
        match self.repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(git_err(&format!("resolve {}", name), e)),
        }
    }

    /// Fetch the remote branch and make the working copy an exact mirror of it.
    ///
    /// Local commits, edits and untracked files are discarded. If the fetch
    /// fails the working copy is left untouched and `Sync` is returned.
    #[instrument(skip(self), level = "debug")]
    pub fn ensure_up_to_date(&mut self) -> Result<(), VaultError> {
        self.check_deadline("fetch")?;
        self.transport.fetch(&self.repo, &self.branch)?;
        self.known_good = self.lookup(&self.tracking_ref())?;
        self.restore_known_good()
    }

    /// Discard local changes and return to the last acknowledged tip.
    pub fn restore_known_good(&mut self) -> Result<(), VaultError> {
        let local_ref = self.local_ref();
        match self.known_good {
            Some(oid) => {
                self.repo
                    .reference(&local_ref, oid, true, "cadvault: mirror remote")
                    .map_err(|e| git_err("move branch", e))?;
                self.repo
                    .set_head(&local_ref)
                    .map_err(|e| git_err("set HEAD", e))?;
                let object = self
                    .repo
                    .find_object(oid, None)
                    .map_err(|e| git_err("find tip", e))?;
                self.repo
                    .reset(&object, ResetType::Hard, None)
                    .map_err(|e| git_err("reset working copy", e))?;
                // Hard reset keeps untracked files; drop them too
                let mut checkout = CheckoutBuilder::new();
                checkout.force().remove_untracked(true);
                self.repo
                    .checkout_head(Some(&mut checkout))
                    .map_err(|e| git_err("clean working copy", e))?;
                debug!("Working copy at {}", oid);
            }
            None => {
                // Remote branch not born yet: mirror is the empty tree
                if let Ok(mut reference) = self.repo.find_reference(&local_ref) {
                    reference
                        .delete()
                        .map_err(|e| git_err("delete local branch", e))?;
                }
                self.repo
                    .set_head(&local_ref)
                    .map_err(|e| git_err("set HEAD", e))?;
                let mut index = self.repo.index().map_err(|e| git_err("open index", e))?;
                index.clear().map_err(|e| git_err("clear index", e))?;
                index.write().map_err(|e| git_err("write index", e))?;
                clear_worktree(&self.workdir)?;
                debug!("Working copy empty, remote branch {} is unborn", self.branch);
            }
        }
        Ok(())
    }

    /// Stage `paths` (additions, edits and deletions alike), commit and push.
    ///
    /// Returns `None` without pushing when the staged tree equals the tip.
    /// On any failure the working copy is restored to the last acknowledged
    /// tip before the error is returned.
    #[instrument(skip(self, message, author, committer), level = "debug")]
    pub fn publish(
        &mut self,
        paths: &[String],
        message: &str,
        author: &Identity,
        committer: &Identity,
    ) -> Result<Option<Oid>, VaultError> {
        match self.commit_and_push(paths, message, author, committer) {
            Ok(oid) => Ok(oid),
            Err(e) => {
                warn!("Publish failed, restoring last known-good state: {}", e);
                if let Err(restore_err) = self.restore_known_good() {
                    warn!("Failed to restore working copy: {}", restore_err);
                }
                Err(e)
            }
        }
    }

    fn commit_and_push(
        &mut self,
        paths: &[String],
        message: &str,
        author: &Identity,
        committer: &Identity,
    ) -> Result<Option<Oid>, VaultError> {
        let mut index = self.repo.index().map_err(|e| git_err("open index", e))?;
        for path in paths {
            let rel = Path::new(path);
            if self.workdir.join(path).is_file() {
                index
                    .add_path(rel)
                    .map_err(|e| git_err(&format!("stage {}", path), e))?;
            } else {
                index
                    .remove_path(rel)
                    .map_err(|e| git_err(&format!("unstage {}", path), e))?;
            }
        }
        index.write().map_err(|e| git_err("write index", e))?;
        let tree_id = index.write_tree().map_err(|e| git_err("write tree", e))?;

        let parent = match self.known_good {
            Some(oid) => Some(
                self.repo
                    .find_commit(oid)
                    .map_err(|e| git_err("find parent", e))?,
            ),
            None => None,
        };
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(|e| git_err("find tree", e))?;
        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_id,
            // Unborn branch: an empty tree is not worth a root commit
            None => tree.is_empty(),
        };
        if unchanged {
            debug!("Nothing to publish");
            return Ok(None);
        }
        let author_sig =
            Signature::now(&author.name, &author.email).map_err(|e| git_err("sign", e))?;
        let committer_sig =
            Signature::now(&committer.name, &committer.email).map_err(|e| git_err("sign", e))?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();

        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &author_sig,
                &committer_sig,
                message,
                &tree,
                &parents,
            )
            .map_err(|e| git_err("commit", e))?;

        // A late operation must not land: its caller has already been told it failed
        self.check_deadline("push")?;
        self.transport.push(&self.repo, &self.branch)?;

        // Remote accepted it: this is the new acknowledged tip
        self.repo
            .reference(&self.tracking_ref(), oid, true, "cadvault: publish")
            .map_err(|e| git_err("update tracking ref", e))?;
        self.known_good = Some(oid);
        info!("Published {}", oid);
        Ok(Some(oid))
    }

    /// Whether `path` is tracked at the current tip.
    pub fn is_tracked(&self, path: &str) -> Result<bool, VaultError> {
        let index = self.repo.index().map_err(|e| git_err("open index", e))?;
        Ok(index.get_path(Path::new(path), 0).is_some())
    }

    /// Content of `path` in the working copy.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VaultError> {
        let full = self.workdir.join(path);
        match std::fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(path.to_string()))
            }
            Err(e) => Err(VaultError::Io(format!(
                "Failed to read {}: {}",
                full.display(),
                e
            ))),
        }
    }

    fn resolve_commit(&self, rev: &str) -> Result<Commit<'_>, VaultError> {
        let object = self
            .repo
            .revparse_single(rev)
            .map_err(|_| VaultError::InvalidTarget(format!("unknown revision '{}'", rev)))?;
        object
            .peel_to_commit()
            .map_err(|_| VaultError::InvalidTarget(format!("'{}' is not a commit", rev)))
    }

    fn blob_at(&self, commit: &Commit<'_>, path: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let tree = commit.tree().map_err(|e| git_err("read tree", e))?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(git_err(&format!("look up {}", path), e)),
        };
        let blob = entry
            .to_object(&self.repo)
            .and_then(|object| object.peel_to_blob())
            .map_err(|e| git_err(&format!("read blob {}", path), e))?;
        Ok(Some(blob.content().to_vec()))
    }

    /// Content of `path` at commit `rev`, or `None` if the file is absent there.
    pub fn try_read_file_at(&self, path: &str, rev: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let commit = self.resolve_commit(rev)?;
        self.blob_at(&commit, path)
    }

    pub fn read_file_at(&self, path: &str, rev: &str) -> Result<Vec<u8>, VaultError> {
        self.try_read_file_at(path, rev)?
            .ok_or_else(|| VaultError::NotFound(format!("{} at {}", path, rev)))
    }

    /// Id of the first parent of `rev`; `InvalidTarget` for a root commit.
    pub fn parent_of(&self, rev: &str) -> Result<String, VaultError> {
        let commit = self.resolve_commit(rev)?;
        if commit.parent_count() == 0 {
            return Err(VaultError::InvalidTarget(format!(
                "{} has no parent",
                commit.id()
            )));
        }
        commit
            .parent_id(0)
            .map(|oid| oid.to_string())
            .map_err(|e| git_err("read parent", e))
    }

    fn touches(&self, commit: &Commit<'_>, paths: &[String]) -> Result<bool, VaultError> {
        let tree = commit.tree().map_err(|e| git_err("read tree", e))?;
        let parent_tree = if commit.parent_count() > 0 {
            let parent = commit.parent(0).map_err(|e| git_err("read parent", e))?;
            Some(parent.tree().map_err(|e| git_err("read tree", e))?)
        } else {
            None
        };

        let mut opts = DiffOptions::new();
        // File names may contain glob characters
        opts.disable_pathspec_match(true);
        for path in paths {
            opts.pathspec(path.as_str());
        }
        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
            .map_err(|e| git_err("diff commit", e))?;
        Ok(diff.deltas().len() > 0)
    }

    /// Newest-first commits touching any of `paths` (all commits when empty).
    pub fn history(&self, paths: &[String], limit: usize) -> Result<Vec<CommitEvent>, VaultError> {
        self.history_where(paths, limit, |_| true)
    }

    /// Like [`history`](Self::history), keeping only events accepted by `keep`.
    pub fn history_where<F>(
        &self,
        paths: &[String],
        limit: usize,
        mut keep: F,
    ) -> Result<Vec<CommitEvent>, VaultError>
    where
        F: FnMut(&CommitEvent) -> bool,
    {
        let Some(tip) = self.known_good else {
            return Ok(vec![]);
        };
        let mut walk = self.repo.revwalk().map_err(|e| git_err("walk history", e))?;
        walk.push(tip).map_err(|e| git_err("walk history", e))?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)
            .map_err(|e| git_err("walk history", e))?;

        let mut events = Vec::new();
        for oid in walk {
            if events.len() >= limit {
                break;
            }
            let oid = oid.map_err(|e| git_err("walk history", e))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(|e| git_err("read commit", e))?;
            if !paths.is_empty() && !self.touches(&commit, paths)? {
                continue;
            }
            let event = commit_event(&commit);
            if keep(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Distinct author names across the whole history.
    pub fn authors(&self) -> Result<Vec<String>, VaultError> {
        let Some(tip) = self.known_good else {
            return Ok(vec![]);
        };
        let mut walk = self.repo.revwalk().map_err(|e| git_err("walk history", e))?;
        walk.push(tip).map_err(|e| git_err("walk history", e))?;

        let mut names = BTreeSet::new();
        for oid in walk {
            let oid = oid.map_err(|e| git_err("walk history", e))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(|e| git_err("read commit", e))?;
            let author = commit.author();
            if let Some(name) = author.name() {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// User-visible tracked files, optionally filtered by a glob `pattern`.
    ///
    /// The pattern is matched against both the full path and the file name.
    pub fn list_tracked_files(&self, pattern: Option<&str>) -> Result<Vec<TrackedFile>, VaultError> {
        let matcher = match pattern.map(str::trim) {
            Some(p) if !p.is_empty() => Some(
                Glob::new(p)
                    .map_err(|e| {
                        VaultError::InvalidArgument(format!("invalid pattern '{}': {}", p, e))
                    })?
                    .compile_matcher(),
            ),
            _ => None,
        };

        let index = self.repo.index().map_err(|e| git_err("open index", e))?;
        let mut files = Vec::new();
        for entry in index.iter() {
            let path = String::from_utf8_lossy(&entry.path).to_string();
            if paths::is_internal(&path) {
                continue;
            }
            if let Some(matcher) = &matcher {
                let name = path.rsplit('/').next().unwrap_or(&path);
                if !matcher.is_match(&path) && !matcher.is_match(name) {
                    continue;
                }
            }
            let meta = match std::fs::metadata(self.workdir.join(&path)) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(VaultError::Io(format!(
                        "Failed to stat {}: {}",
                        path, e
                    )))
                }
            };
            let modified_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            files.push(TrackedFile {
                path,
                size_bytes: meta.len(),
                modified_at,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn commit_event(commit: &Commit<'_>) -> CommitEvent {
    let raw = commit.message().unwrap_or_default();
    let (subject, body) = convention::split_message(raw);
    let timestamp = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default();
    let commit_id = commit.id().to_string();

    match CommitSubject::parse(subject) {
        Some(parsed) => CommitEvent {
            commit_id,
            actor: parsed.actor,
            timestamp,
            kind: Some(parsed.kind),
            file: Some(parsed.target),
            revision: parsed.revision,
            message: body.to_string(),
        },
        None => CommitEvent {
            commit_id,
            actor: commit.author().name().unwrap_or("unknown").to_string(),
            timestamp,
            kind: None,
            file: None,
            revision: None,
            message: raw.trim().to_string(),
        },
    }
}

fn clear_worktree(root: &Path) -> Result<(), VaultError> {
    let entries = std::fs::read_dir(root)
        .map_err(|e| VaultError::Io(format!("Failed to read dir {}: {}", root.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::Io(format!("Failed to read dir entry: {}", e)))?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| VaultError::Io(format!("Failed to remove {}: {}", path.display(), e)))?;
    }
    Ok(())
}
