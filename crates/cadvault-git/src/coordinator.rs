//! Checkout/checkin state machine over the shared repository.
//!
//! Every operation runs inside one process-wide gate: the working copy is
//! synced, the request is validated against fresh state, local files are
//! changed and the change is published as a single commit. If validation,
//! the local change or the publish fails, the working copy is put back on
//! the last tip the remote acknowledged. Observers are notified after the
//! gate is released.

use std::collections::HashMap;
use std::sync::Arc;

use cadvault_core::{
    group_files, next_revision, CommitEvent, CommitSubject, FileGroup, FileRecord, Identity,
    LockRecord, LockSummary, Notification, OperationKind, Revision, RevisionClass,
    RevisionMetadata, UserMessage, VaultError,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::hub::NotificationHub;
use crate::lock::LockStore;
use crate::messages;
use crate::paths::{sidecar_path, validate_repo_path};
use crate::sidecar;
use crate::snapshot::{Git2Transport, RemoteTransport, RepositorySnapshot};
use crate::watch::ChangeMonitor;

/// Revision assigned to an upload that does not name one
pub const DEFAULT_UPLOAD_REVISION: &str = "1.0";

/// Shared state observers are told about.
#[derive(Debug, Clone)]
pub struct VaultState {
    pub groups: Vec<FileGroup>,
    pub locks: Vec<LockSummary>,
}

impl VaultState {
    pub fn notifications(&self) -> [Notification; 2] {
        [
            Notification::FileListChanged {
                groups: self.groups.clone(),
            },
            Notification::LockChanged {
                locks: self.locks.clone(),
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct CheckinRequest {
    pub path: String,
    pub user: String,
    pub content: Vec<u8>,
    pub class: RevisionClass,
    pub explicit_major: Option<u32>,
    /// Replaces the stored description when set
    pub description: Option<String>,
    /// Free-text commit body
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: String,
    pub user: String,
    pub content: Vec<u8>,
    /// Initial revision, `1.0` when absent
    pub revision: Option<String>,
    pub description: String,
}

/// Working copy and everything derived from it. Only reachable through the gate.
struct Workspace {
    snapshot: RepositorySnapshot,
    locks: LockStore,
    monitor: ChangeMonitor,
}

/// Local change waiting to be published.
struct Staged<T> {
    value: T,
    paths: Vec<String>,
    subject: CommitSubject,
    body: String,
    /// Whether observers should hear about it (message traffic is private)
    announce: bool,
}

impl<T> Staged<T> {
    fn new(value: T, paths: Vec<String>, subject: CommitSubject) -> Self {
        Self {
            value,
            paths,
            subject,
            body: String::new(),
            announce: true,
        }
    }

    fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    fn quiet(mut self) -> Self {
        self.announce = false;
        self
    }
}

struct Outcome<T> {
    value: T,
    announce: Option<VaultState>,
}

impl Workspace {
    fn root(&self) -> std::path::PathBuf {
        self.snapshot.workdir().to_path_buf()
    }

    /// Sync, stage through `mutate`, publish. Rolls back on any failure.
    fn transact<T, F>(
        &mut self,
        config: &EngineConfig,
        actor: &str,
        mutate: F,
    ) -> Result<Outcome<T>, VaultError>
    where
        F: FnOnce(&mut Workspace) -> Result<Staged<T>, VaultError>,
    {
        self.snapshot.ensure_up_to_date()?;

        let staged = match mutate(self) {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(restore_err) = self.snapshot.restore_known_good() {
                    warn!("Failed to discard local changes: {}", restore_err);
                }
                return Err(e);
            }
        };

        let message = staged.subject.message(&staged.body);
        let author = Identity::for_user(actor);
        let published = self
            .snapshot
            .publish(&staged.paths, &message, &author, &config.committer)?;

        let announce = match published {
            Some(_) => {
                info!("{}", staged.subject.format());
                self.after_publish(staged.announce)
            }
            None => None,
        };
        Ok(Outcome {
            value: staged.value,
            announce,
        })
    }

    /// Refresh the monitor so the poller does not report our own publish again.
    fn after_publish(&mut self, announce: bool) -> Option<VaultState> {
        if let Err(e) = self.monitor.refresh(&self.snapshot, &self.locks) {
            warn!("Failed to refresh change monitor: {}", e);
        }
        if !announce {
            return None;
        }
        match self.state() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to build notification state: {}", e);
                None
            }
        }
    }

    fn file_records(&self, pattern: Option<&str>) -> Result<Vec<FileRecord>, VaultError> {
        let root = self.root();
        let mut locks: HashMap<String, LockRecord> = self
            .locks
            .all_active()?
            .into_iter()
            .map(|record| (record.file.clone(), record))
            .collect();

        let mut records = Vec::new();
        for tracked in self.snapshot.list_tracked_files(pattern)? {
            let meta = sidecar::read(&root, &tracked.path)?.unwrap_or_default();
            let lock = locks.remove(&tracked.path);
            records.push(FileRecord {
                path: tracked.path,
                size_bytes: tracked.size_bytes,
                modified_at: tracked.modified_at,
                description: meta.description,
                revision: meta.revision,
                lock,
            });
        }
        Ok(records)
    }

    fn lock_summaries(&self) -> Result<Vec<LockSummary>, VaultError> {
        let now = Utc::now();
        Ok(self
            .locks
            .all_active()?
            .into_iter()
            .map(|record| LockSummary::from_record(record, now))
            .collect())
    }

    fn state(&self) -> Result<VaultState, VaultError> {
        Ok(VaultState {
            groups: group_files(self.file_records(None)?),
            locks: self.lock_summaries()?,
        })
    }

    /// Newest revision any commit recorded for `path`, deleted files included.
    fn latest_published_revision(&self, path: &str) -> Result<Option<String>, VaultError> {
        let paths = [path.to_string(), sidecar_path(path)];
        Ok(self
            .snapshot
            .history_where(&paths, 1, |event| event.revision.is_some())?
            .into_iter()
            .next()
            .and_then(|event| event.revision))
    }

    fn require_owner(&self, path: &str, user: &str) -> Result<LockRecord, VaultError> {
        match self.locks.get(path)? {
            Some(record) if record.user == user => Ok(record),
            _ => Err(VaultError::NotOwner {
                path: path.to_string(),
                user: user.to_string(),
            }),
        }
    }

    fn require_unlocked(&self, path: &str) -> Result<(), VaultError> {
        match self.locks.get(path)? {
            Some(record) => Err(VaultError::FileLocked {
                path: path.to_string(),
                owner: record.user,
            }),
            None => Ok(()),
        }
    }

    fn require_tracked(&self, path: &str) -> Result<(), VaultError> {
        if self.snapshot.is_tracked(path)? {
            Ok(())
        } else {
            Err(VaultError::NotFound(path.to_string()))
        }
    }
}

fn validate_user(user: &str) -> Result<String, VaultError> {
    let user = user.trim();
    if user.is_empty() || user.chars().any(char::is_control) {
        return Err(VaultError::InvalidArgument(format!(
            "invalid user name '{}'",
            user
        )));
    }
    Ok(user.to_string())
}

/// Entry point for every read and write against the shared repository.
#[derive(Clone)]
pub struct Coordinator {
    gate: Arc<Mutex<Workspace>>,
    config: Arc<EngineConfig>,
    hub: NotificationHub,
}

impl Coordinator {
    /// Open the working copy with the default git transport.
    pub fn open(config: EngineConfig) -> Result<Self, VaultError> {
        let transport = Git2Transport::new(config.credential.clone(), config.network_timeout);
        Self::with_transport(config, Box::new(transport))
    }

    pub fn with_transport(
        config: EngineConfig,
        transport: Box<dyn RemoteTransport>,
    ) -> Result<Self, VaultError> {
        let snapshot = RepositorySnapshot::open(
            &config.work_dir,
            &config.remote_url,
            &config.branch,
            transport,
        )?;
        let locks = LockStore::new(&config.work_dir);
        info!(
            "Working copy {} tracking {} on {}",
            config.work_dir.display(),
            config.branch,
            config.remote_url
        );

        Ok(Self {
            gate: Arc::new(Mutex::new(Workspace {
                snapshot,
                locks,
                monitor: ChangeMonitor::new(),
            })),
            config: Arc::new(config),
            hub: NotificationHub::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Run `f` on the working copy while holding the gate.
    ///
    /// Waiting for the gate is bounded by the operation timeout. Once the
    /// gate is held, the work runs on the blocking pool with a deadline at
    /// the same instant: nothing is fetched or pushed after it, so a late
    /// operation rolls back and reports `Sync` instead of landing on the
    /// remote. Fetch and push are themselves bounded by the transport.
    async fn with_workspace<T, F>(&self, op: &'static str, f: F) -> Result<T, VaultError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Workspace, &EngineConfig) -> Result<T, VaultError> + Send + 'static,
    {
        let timeout = self.config.operation_timeout();
        let deadline = std::time::Instant::now() + timeout;

        let mut guard = match tokio::time::timeout(timeout, self.gate.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("{} waited {:?} for the working copy", op, timeout);
                return Err(VaultError::Sync(format!(
                    "{} timed out waiting for the working copy after {:?}",
                    op, timeout
                )));
            }
        };
        let config = self.config.clone();
        let task = tokio::task::spawn_blocking(move || {
            let ws = &mut *guard;
            ws.snapshot.set_deadline(Some(deadline));
            let result = f(ws, &config);
            ws.snapshot.set_deadline(None);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(VaultError::Internal(format!("{} task failed: {}", op, e))),
        }
    }

    async fn mutate<T, F>(&self, op: &'static str, f: F) -> Result<T, VaultError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Workspace, &EngineConfig) -> Result<Outcome<T>, VaultError>
            + Send
            + 'static,
    {
        let outcome = self.with_workspace(op, f).await?;
        if let Some(state) = outcome.announce {
            self.announce(&state);
        }
        Ok(outcome.value)
    }

    fn announce(&self, state: &VaultState) {
        for notification in state.notifications() {
            self.hub.broadcast(&notification);
        }
    }

    fn require_admin(&self, user: &str) -> Result<(), VaultError> {
        if self.config.is_admin(user) {
            Ok(())
        } else {
            Err(VaultError::Forbidden(format!("{} is not an admin", user)))
        }
    }

    fn check_size(&self, content: &[u8]) -> Result<(), VaultError> {
        let size = content.len() as u64;
        if size > self.config.max_upload_bytes {
            return Err(VaultError::InvalidArgument(format!(
                "file of {} bytes exceeds the {} byte limit",
                size, self.config.max_upload_bytes
            )));
        }
        Ok(())
    }

    /// Take the checkout on `path` for `user`. Re-checkout by the holder refreshes it.
    #[instrument(skip(self), level = "debug")]
    pub async fn checkout(&self, path: &str, user: &str) -> Result<LockRecord, VaultError> {
        let path = validate_repo_path(path)?;
        let user = validate_user(user)?;

        self.mutate("checkout", move |ws, config| {
            ws.transact(config, &user, |ws| {
                ws.require_tracked(&path)?;
                let record = ws.locks.acquire(&path, &user, Utc::now())?;
                Ok(Staged::new(
                    record,
                    vec![LockStore::record_path(&path)],
                    CommitSubject::new(OperationKind::Checkout, path.as_str(), user.as_str()),
                ))
            })
        })
        .await
    }

    /// Store new content, bump the revision and release the checkout, as one commit.
    #[instrument(skip(self, request), fields(path = %request.path, user = %request.user), level = "debug")]
    pub async fn checkin(&self, request: CheckinRequest) -> Result<RevisionMetadata, VaultError> {
        let path = validate_repo_path(&request.path)?;
        let user = validate_user(&request.user)?;
        self.check_size(&request.content)?;

        self.mutate("checkin", move |ws, config| {
            ws.transact(config, &user, |ws| {
                ws.require_owner(&path, &user)?;
                let root = ws.root();

                let current = sidecar::read(&root, &path)?.unwrap_or_default();
                let revision = next_revision(
                    &current.revision,
                    request.class,
                    request.explicit_major,
                );
                let meta = RevisionMetadata {
                    description: request.description.unwrap_or(current.description),
                    revision: revision.clone(),
                };

                sidecar::write_bytes(&root, &path, &request.content)?;
                let sidecar_rel = sidecar::write(&root, &path, &meta)?;
                ws.locks.release(&path)?;
                debug!("{} -> {} for {}", current.revision, revision, path);

                Ok(Staged::new(
                    meta,
                    vec![path.clone(), sidecar_rel, LockStore::record_path(&path)],
                    CommitSubject::new(OperationKind::Checkin, path.as_str(), user.as_str())
                        .with_revision(revision),
                )
                .body(request.message))
            })
        })
        .await
    }

    /// Release the holder's checkout without changing content.
    #[instrument(skip(self), level = "debug")]
    pub async fn cancel(&self, path: &str, user: &str) -> Result<(), VaultError> {
        let path = validate_repo_path(path)?;
        let user = validate_user(user)?;

        self.mutate("cancel", move |ws, config| {
            ws.transact(config, &user, |ws| {
                ws.require_owner(&path, &user)?;
                ws.locks.release(&path)?;
                Ok(Staged::new(
                    (),
                    vec![LockStore::record_path(&path)],
                    CommitSubject::new(OperationKind::Cancel, path.as_str(), user.as_str()),
                ))
            })
        })
        .await
    }

    /// Release any checkout on `path`. Returns the lock that was removed, if any.
    #[instrument(skip(self), level = "debug")]
    pub async fn admin_override(
        &self,
        path: &str,
        admin: &str,
    ) -> Result<Option<LockRecord>, VaultError> {
        let path = validate_repo_path(path)?;
        let admin = validate_user(admin)?;
        self.require_admin(&admin)?;

        self.mutate("override", move |ws, config| {
            ws.transact(config, &admin, |ws| {
                let Some(previous) = ws.locks.get(&path)? else {
                    debug!("{} is not checked out, nothing to override", path);
                    return Ok(Staged::new(
                        None,
                        vec![],
                        CommitSubject::new(OperationKind::Override, path.as_str(), admin.as_str()),
                    ));
                };
                ws.locks.release(&path)?;
                let body = format!("released checkout held by {}", previous.user);
                Ok(Staged::new(
                    Some(previous),
                    vec![LockStore::record_path(&path)],
                    CommitSubject::new(OperationKind::Override, path.as_str(), admin.as_str()),
                )
                .body(body))
            })
        })
        .await
    }

    /// Remove a file and its metadata. The file must not be checked out.
    #[instrument(skip(self), level = "debug")]
    pub async fn admin_delete(&self, path: &str, admin: &str) -> Result<(), VaultError> {
        let path = validate_repo_path(path)?;
        let admin = validate_user(admin)?;
        self.require_admin(&admin)?;

        self.mutate("delete", move |ws, config| {
            ws.transact(config, &admin, |ws| {
                ws.require_tracked(&path)?;
                ws.require_unlocked(&path)?;
                let root = ws.root();
                let sidecar_rel = sidecar_path(&path);
                sidecar::remove(&root, &path)?;
                sidecar::remove(&root, &sidecar_rel)?;
                Ok(Staged::new(
                    (),
                    vec![path.clone(), sidecar_rel, LockStore::record_path(&path)],
                    CommitSubject::new(OperationKind::Delete, path.as_str(), admin.as_str()),
                ))
            })
        })
        .await
    }

    /// Restore `path` to its state just before commit `target`, as a new commit.
    ///
    /// Content and description come from the parent of `target`; the revision
    /// moves one minor step past the highest one the file has carried, so
    /// restoring a deleted file never lowers it.
    #[instrument(skip(self), level = "debug")]
    pub async fn revert(
        &self,
        path: &str,
        admin: &str,
        target: &str,
    ) -> Result<RevisionMetadata, VaultError> {
        let path = validate_repo_path(path)?;
        let admin = validate_user(admin)?;
        self.require_admin(&admin)?;
        let target = target.trim().to_string();

        self.mutate("revert", move |ws, config| {
            ws.transact(config, &admin, |ws| {
                ws.require_unlocked(&path)?;
                let parent = ws.snapshot.parent_of(&target)?;
                let sidecar_rel = sidecar_path(&path);

                let content = ws
                    .snapshot
                    .try_read_file_at(&path, &parent)?
                    .ok_or_else(|| {
                        VaultError::InvalidTarget(format!(
                            "{} did not exist before {}",
                            path, target
                        ))
                    })?;
                let restored = ws
                    .snapshot
                    .try_read_file_at(&sidecar_rel, &parent)?
                    .map(|bytes| sidecar::decode(&path, &bytes))
                    .unwrap_or_default();

                let root = ws.root();
                let current = sidecar::read(&root, &path)?.unwrap_or_default();
                let latest = ws.latest_published_revision(&path)?;
                let base = [&current.revision, &restored.revision]
                    .into_iter()
                    .chain(latest.as_ref())
                    .map(|rev| Revision::parse_lenient(rev))
                    .max()
                    .unwrap_or_default();
                let meta = RevisionMetadata {
                    description: restored.description,
                    revision: next_revision(&base.to_string(), RevisionClass::Minor, None),
                };

                sidecar::write_bytes(&root, &path, &content)?;
                sidecar::write(&root, &path, &meta)?;
                let body = format!("restored state before {}", target);
                let revision = meta.revision.clone();
                Ok(Staged::new(
                    meta,
                    vec![path.clone(), sidecar_rel],
                    CommitSubject::new(OperationKind::Revert, path.as_str(), admin.as_str())
                        .with_revision(revision),
                )
                .body(body))
            })
        })
        .await
    }

    /// Add a file that does not exist yet.
    #[instrument(skip(self, request), fields(path = %request.path, user = %request.user), level = "debug")]
    pub async fn upload(&self, request: UploadRequest) -> Result<RevisionMetadata, VaultError> {
        let path = validate_repo_path(&request.path)?;
        let user = validate_user(&request.user)?;
        self.check_size(&request.content)?;
        let revision = match request.revision.as_deref().map(str::trim) {
            Some(rev) if !rev.is_empty() => rev
                .parse::<Revision>()
                .map_err(|_| VaultError::InvalidArgument(format!("malformed revision '{}'", rev)))?
                .to_string(),
            _ => DEFAULT_UPLOAD_REVISION.to_string(),
        };

        self.mutate("upload", move |ws, config| {
            ws.transact(config, &user, |ws| {
                let root = ws.root();
                if ws.snapshot.is_tracked(&path)? || root.join(&path).exists() {
                    return Err(VaultError::AlreadyExists(path.clone()));
                }
                let meta = RevisionMetadata {
                    description: request.description,
                    revision: revision.clone(),
                };
                sidecar::write_bytes(&root, &path, &request.content)?;
                let sidecar_rel = sidecar::write(&root, &path, &meta)?;
                Ok(Staged::new(
                    meta,
                    vec![path.clone(), sidecar_rel],
                    CommitSubject::new(OperationKind::Upload, path.as_str(), user.as_str())
                        .with_revision(revision),
                ))
            })
        })
        .await
    }

    /// Remove checkouts older than the configured maximum age.
    #[instrument(skip(self), level = "debug")]
    pub async fn purge_stale_locks(&self) -> Result<Vec<LockRecord>, VaultError> {
        self.mutate("purge", move |ws, config| {
            let actor = config.committer.name.clone();
            ws.transact(config, &actor, |ws| {
                let removed = ws.locks.purge_stale(config.lock_max_age, Utc::now())?;
                let paths = removed
                    .iter()
                    .map(|record| LockStore::record_path(&record.file))
                    .collect();
                let body = removed
                    .iter()
                    .map(|record| format!("{} ({})", record.file, record.user))
                    .collect::<Vec<_>>()
                    .join("\n");
                let target = format!("{} stale locks", removed.len());
                Ok(Staged::new(
                    removed,
                    paths,
                    CommitSubject::new(OperationKind::Purge, target, actor.as_str()),
                )
                .body(body))
            })
        })
        .await
    }

    /// Queue a message for `to` and deliver it to their observers.
    #[instrument(skip(self, text), level = "debug")]
    pub async fn post_message(&self, from: &str, to: &str, text: &str) -> Result<(), VaultError> {
        let from = validate_user(from)?;
        let to = validate_user(to)?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(VaultError::InvalidArgument("empty message".into()));
        }

        let recipient = to.clone();
        let pending = self
            .mutate("message", move |ws, config| {
                ws.transact(config, &from, |ws| {
                    let root = ws.root();
                    let message = UserMessage {
                        from: from.clone(),
                        text,
                        sent_at: Utc::now(),
                    };
                    let rel = messages::append(&root, &to, message)?;
                    let pending = messages::pending(&root, &to)?;
                    Ok(Staged::new(
                        pending,
                        vec![rel],
                        CommitSubject::new(OperationKind::Message, to.as_str(), from.as_str()),
                    )
                    .quiet())
                })
            })
            .await?;

        self.hub.send_to_user(
            &recipient,
            &Notification::PendingMessages {
                user: recipient.clone(),
                messages: pending,
            },
        );
        Ok(())
    }

    /// Remove and return the messages queued for `user`.
    #[instrument(skip(self), level = "debug")]
    pub async fn take_messages(&self, user: &str) -> Result<Vec<UserMessage>, VaultError> {
        let user = validate_user(user)?;
        self.mutate("read messages", move |ws, config| {
            ws.transact(config, &user, |ws| {
                let root = ws.root();
                let pending = messages::pending(&root, &user)?;
                let mut paths = vec![];
                if !pending.is_empty() {
                    messages::clear(&root, &user)?;
                    paths.push(messages::queue_path(&user));
                }
                Ok(Staged::new(
                    pending,
                    paths,
                    CommitSubject::new(OperationKind::MessageRead, user.as_str(), user.as_str()),
                )
                .quiet())
            })
        })
        .await
    }

    /// Messages waiting for `user`, without consuming them.
    pub async fn pending_messages(&self, user: &str) -> Result<Vec<UserMessage>, VaultError> {
        let user = validate_user(user)?;
        self.with_workspace("pending messages", move |ws, _| {
            messages::pending(&ws.root(), &user)
        })
        .await
    }

    pub async fn list_files(&self, pattern: Option<String>) -> Result<Vec<FileRecord>, VaultError> {
        self.with_workspace("list files", move |ws, _| {
            ws.file_records(pattern.as_deref())
        })
        .await
    }

    pub async fn list_groups(&self, pattern: Option<String>) -> Result<Vec<FileGroup>, VaultError> {
        Ok(group_files(self.list_files(pattern).await?))
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, VaultError> {
        let path = validate_repo_path(path)?;
        self.with_workspace("read file", move |ws, _| {
            ws.require_tracked(&path)?;
            ws.snapshot.read_file(&path)
        })
        .await
    }

    /// File content at any rev-parse expression, typically a commit id.
    pub async fn read_file_at(&self, path: &str, rev: &str) -> Result<Vec<u8>, VaultError> {
        let path = validate_repo_path(path)?;
        let rev = rev.trim().to_string();
        self.with_workspace("read file at revision", move |ws, _| {
            ws.snapshot.read_file_at(&path, &rev)
        })
        .await
    }

    /// Commits touching the file, its metadata or its checkout, newest first.
    pub async fn history(&self, path: &str, limit: usize) -> Result<Vec<CommitEvent>, VaultError> {
        let path = validate_repo_path(path)?;
        self.with_workspace("history", move |ws, _| {
            let paths = [
                sidecar_path(&path),
                LockStore::record_path(&path),
                path,
            ];
            ws.snapshot.history(&paths, limit)
        })
        .await
    }

    pub async fn list_locks(&self) -> Result<Vec<LockSummary>, VaultError> {
        self.with_workspace("list locks", |ws, _| ws.lock_summaries())
            .await
    }

    pub async fn authors(&self) -> Result<Vec<String>, VaultError> {
        self.with_workspace("authors", |ws, _| ws.snapshot.authors())
            .await
    }

    /// Latest file operations across the repository, newest first.
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<CommitEvent>, VaultError> {
        self.with_workspace("activity", move |ws, _| {
            ws.snapshot.history_where(&[], limit, |event| {
                event.kind.is_some_and(|kind| kind.is_file_operation())
            })
        })
        .await
    }

    /// Current files and locks, as sent to a newly connected observer.
    pub async fn current_state(&self) -> Result<VaultState, VaultError> {
        self.with_workspace("state", |ws, _| ws.state()).await
    }

    /// Sync and return the new state when the tip or lock set moved.
    pub async fn poll_changes(&self) -> Result<Option<VaultState>, VaultError> {
        self.with_workspace("poll", |ws, _| {
            if ws.monitor.poll(&mut ws.snapshot, &ws.locks)? {
                Ok(Some(ws.state()?))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Poll once, broadcast on change and deliver queued messages.
    ///
    /// Returns whether a change was broadcast.
    pub async fn poll_and_notify(&self) -> Result<bool, VaultError> {
        let Some(state) = self.poll_changes().await? else {
            return Ok(false);
        };
        self.announce(&state);

        let users: Vec<String> = self.hub.connected_users().into_iter().collect();
        if users.is_empty() {
            return Ok(true);
        }
        let queues = self
            .with_workspace("deliver messages", move |ws, _| {
                let root = ws.root();
                let mut queues = Vec::new();
                for user in users {
                    let pending = messages::pending(&root, &user)?;
                    if !pending.is_empty() {
                        queues.push((user, pending));
                    }
                }
                Ok(queues)
            })
            .await?;
        for (user, pending) in queues {
            self.hub.send_to_user(
                &user,
                &Notification::PendingMessages {
                    user: user.clone(),
                    messages: pending,
                },
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FaultyTransport, TestRemote};
    use std::time::Duration;
    use tempfile::TempDir;

    const PART: &str = "7654321_AB1.mcam";

    fn setup(remote: &TestRemote) -> (Coordinator, TempDir) {
        let work = TempDir::new().unwrap();
        let coordinator = Coordinator::open(test_support::config(&remote.url, work.path())).unwrap();
        (coordinator, work)
    }

    fn setup_faulty(remote: &TestRemote) -> (Coordinator, FaultyTransport, TempDir) {
        let work = TempDir::new().unwrap();
        let transport = FaultyTransport::new();
        let coordinator = Coordinator::with_transport(
            test_support::config(&remote.url, work.path()),
            Box::new(transport.clone()),
        )
        .unwrap();
        (coordinator, transport, work)
    }

    /// Instance whose operations give up after two seconds.
    fn setup_bounded(remote: &TestRemote) -> (Coordinator, FaultyTransport, TempDir) {
        let work = TempDir::new().unwrap();
        let mut config = test_support::config(&remote.url, work.path());
        config.network_timeout = Duration::from_secs(1);
        config.local_work_allowance = Duration::ZERO;
        let transport = FaultyTransport::new();
        let coordinator =
            Coordinator::with_transport(config, Box::new(transport.clone())).unwrap();
        (coordinator, transport, work)
    }

    async fn upload(coordinator: &Coordinator, path: &str, user: &str, content: &[u8]) {
        coordinator
            .upload(UploadRequest {
                path: path.into(),
                user: user.into(),
                content: content.to_vec(),
                revision: Some("1.0".into()),
                description: "op10 roughing".into(),
            })
            .await
            .unwrap();
    }

    fn checkin(path: &str, user: &str, content: &[u8]) -> CheckinRequest {
        CheckinRequest {
            path: path.into(),
            user: user.into(),
            content: content.to_vec(),
            class: RevisionClass::Minor,
            explicit_major: None,
            description: None,
            message: "tightened tolerances".into(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_upload_checkout_checkin() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);

        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();
        let meta = coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap();
        assert_eq!(meta.revision, "1.1");
        assert_eq!(meta.description, "op10 roughing");

        let history = coordinator.history(PART, 50).await.unwrap();
        assert!(history.len() >= 2);
        assert_eq!(history[0].kind, Some(OperationKind::Checkin));
        assert_eq!(history[0].revision.as_deref(), Some("1.1"));
        assert_eq!(history[0].message, "tightened tolerances");

        assert!(coordinator.list_locks().await.unwrap().is_empty());
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v2");

        let groups = coordinator.list_groups(None).await.unwrap();
        let group = groups.iter().find(|g| g.key == "7654321").unwrap();
        assert_eq!(group.files[0].revision, "1.1");
        assert!(group.files[0].lock.is_none());

        let activity = coordinator.recent_activity(10).await.unwrap();
        let kinds: Vec<_> = activity.iter().filter_map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::Checkin,
                OperationKind::Checkout,
                OperationKind::Upload
            ]
        );

        let authors = coordinator.authors().await.unwrap();
        assert!(authors.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn test_second_user_gets_already_locked() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        coordinator.checkout(PART, "alice").await.unwrap();
        let err = coordinator.checkout(PART, "bob").await.unwrap_err();
        match err {
            VaultError::AlreadyLocked { owner, .. } => assert_eq!(owner, "alice"),
            other => panic!("unexpected error: {other}"),
        }
        let locks = coordinator.list_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].user, "alice");
    }

    #[tokio::test]
    async fn test_same_user_checkout_refreshes() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        let first = coordinator.checkout(PART, "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = coordinator.checkout(PART, "alice").await.unwrap();
        assert!(second.acquired_at > first.acquired_at);
        assert_eq!(coordinator.list_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkout_unknown_file() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        let err = coordinator.checkout("missing.mcam", "alice").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        assert!(matches!(
            coordinator.checkout("../x", "alice").await.unwrap_err(),
            VaultError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_single_winner() {
        let remote = test_support::seeded_remote();
        let (a, _wa) = setup(&remote);
        let (b, _wb) = setup(&remote);
        upload(&a, PART, "alice", b"v1").await;

        // Same instance: serialized by the gate
        let mut tasks = Vec::new();
        for user in ["u1", "u2", "u3", "u4"] {
            let coordinator = a.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.checkout(PART, user).await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, VaultError::AlreadyLocked { .. }), "{e}"),
            }
        }
        assert_eq!(winners, 1);

        // Two instances racing through the remote
        a.admin_override(PART, "admin").await.unwrap();
        let (ra, rb) = tokio::join!(a.checkout(PART, "carol"), b.checkout(PART, "dave"));
        let (expected, loser) = match (&ra, &rb) {
            (Ok(_), Err(e)) => ("carol", e),
            (Err(e), Ok(_)) => ("dave", e),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        // The loser either saw the lock or lost the push race; never a sync failure
        assert!(
            matches!(loser, VaultError::AlreadyLocked { .. } | VaultError::Conflict(_)),
            "{loser}"
        );
        assert!(!loser.is_retryable());

        b.poll_changes().await.unwrap();
        let locks = b.list_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].user, expected);
    }

    #[tokio::test]
    async fn test_checkin_without_checkout_is_not_owner() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        let err = coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotOwner { .. }));
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v1");

        coordinator.checkout(PART, "bob").await.unwrap();
        let err = coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotOwner { .. }));

        let files = coordinator.list_files(None).await.unwrap();
        let file = files.iter().find(|f| f.path == PART).unwrap();
        assert_eq!(file.revision, "1.0");
        assert_eq!(file.lock.as_ref().unwrap().user, "bob");
    }

    #[tokio::test]
    async fn test_rejected_checkin_keeps_lock_and_content() {
        let remote = test_support::seeded_remote();
        let (coordinator, transport, _work) = setup_faulty(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();

        transport.reject_next_push();
        let err = coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
        assert!(err.requires_resync());

        let locks = coordinator.list_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].user, "alice");
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v1");

        // Retrying after the failure goes through
        let meta = coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap();
        assert_eq!(meta.revision, "1.1");
    }

    #[tokio::test]
    async fn test_rejected_cancel_keeps_lock() {
        let remote = test_support::seeded_remote();
        let (coordinator, transport, _work) = setup_faulty(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();

        transport.reject_next_push();
        assert!(coordinator.cancel(PART, "alice").await.is_err());
        assert_eq!(coordinator.list_locks().await.unwrap().len(), 1);

        assert!(matches!(
            coordinator.cancel(PART, "bob").await.unwrap_err(),
            VaultError::NotOwner { .. }
        ));
        coordinator.cancel(PART, "alice").await.unwrap();
        assert!(coordinator.list_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_override() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();

        assert!(matches!(
            coordinator.admin_override(PART, "bob").await.unwrap_err(),
            VaultError::Forbidden(_)
        ));

        let released = coordinator.admin_override(PART, "admin").await.unwrap();
        assert_eq!(released.unwrap().user, "alice");
        assert!(coordinator.list_locks().await.unwrap().is_empty());

        // Idempotent
        assert!(coordinator
            .admin_override(PART, "admin")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_admin_delete() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();

        let err = coordinator.admin_delete(PART, "admin").await.unwrap_err();
        assert!(matches!(err, VaultError::FileLocked { .. }));
        assert_eq!(err.category(), cadvault_core::ErrorCategory::Conflict);
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v1");

        assert!(matches!(
            coordinator.admin_delete(PART, "alice").await.unwrap_err(),
            VaultError::Forbidden(_)
        ));

        coordinator.cancel(PART, "alice").await.unwrap();
        coordinator.admin_delete(PART, "admin").await.unwrap();
        assert!(matches!(
            coordinator.read_file(PART).await.unwrap_err(),
            VaultError::NotFound(_)
        ));
        assert!(coordinator
            .list_files(None)
            .await
            .unwrap()
            .iter()
            .all(|f| f.path != PART));
        assert!(matches!(
            coordinator.admin_delete(PART, "admin").await.unwrap_err(),
            VaultError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_revert() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        let upload_commit = coordinator.history(PART, 1).await.unwrap()[0]
            .commit_id
            .clone();
        let err = coordinator
            .revert(PART, "admin", &upload_commit)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidTarget(_)));

        coordinator.checkout(PART, "alice").await.unwrap();
        let mut request = checkin(PART, "alice", b"v2");
        request.description = Some("broken edit".into());
        coordinator.checkin(request).await.unwrap();
        let bad_commit = coordinator.history(PART, 1).await.unwrap()[0]
            .commit_id
            .clone();

        assert!(matches!(
            coordinator.revert(PART, "alice", &bad_commit).await.unwrap_err(),
            VaultError::Forbidden(_)
        ));

        let meta = coordinator.revert(PART, "admin", &bad_commit).await.unwrap();
        assert_eq!(meta.revision, "1.2");
        assert_eq!(meta.description, "op10 roughing");
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v1");

        // History is preserved
        let history = coordinator.history(PART, 50).await.unwrap();
        assert_eq!(history[0].kind, Some(OperationKind::Revert));
        assert_eq!(
            coordinator.read_file_at(PART, &bad_commit).await.unwrap(),
            b"v2"
        );

        coordinator.checkout(PART, "bob").await.unwrap();
        assert!(matches!(
            coordinator.revert(PART, "admin", &bad_commit).await.unwrap_err(),
            VaultError::FileLocked { .. }
        ));
    }

    #[tokio::test]
    async fn test_revert_of_deleted_file_keeps_revision_moving_forward() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();
        coordinator
            .checkin(checkin(PART, "alice", b"v2"))
            .await
            .unwrap();
        let checkin_commit = coordinator.history(PART, 1).await.unwrap()[0]
            .commit_id
            .clone();
        coordinator.admin_delete(PART, "admin").await.unwrap();

        // Parent of the check-in holds 1.0, the file last carried 1.1
        let meta = coordinator
            .revert(PART, "admin", &checkin_commit)
            .await
            .unwrap();
        assert_eq!(meta.revision, "1.2");
        assert_eq!(coordinator.read_file(PART).await.unwrap(), b"v1");
        let files = coordinator.list_files(None).await.unwrap();
        let record = files.iter().find(|f| f.path == PART).unwrap();
        assert_eq!(record.revision, "1.2");
    }

    #[tokio::test]
    async fn test_late_mutation_is_rolled_back() {
        let remote = test_support::seeded_remote();
        let (coordinator, transport, _work) = setup_bounded(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        transport.stall_next_fetch(Duration::from_secs(3));
        let err = coordinator.checkout(PART, "alice").await.unwrap_err();
        assert!(matches!(err, VaultError::Sync(_)), "{err}");
        assert!(coordinator.list_locks().await.unwrap().is_empty());

        // Nothing reached the remote
        let (other, _wo) = setup(&remote);
        other.poll_changes().await.unwrap();
        assert!(other.list_locks().await.unwrap().is_empty());

        coordinator.checkout(PART, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_for_busy_working_copy_is_bounded() {
        let remote = test_support::seeded_remote();
        let (coordinator, transport, _work) = setup_bounded(&remote);

        transport.stall_next_fetch(Duration::from_secs(5));
        let busy = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.poll_changes().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let err = coordinator.list_locks().await.unwrap_err();
        assert!(matches!(err, VaultError::Sync(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));

        assert!(busy.await.unwrap().unwrap().is_some());
        assert!(coordinator.list_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;

        let mut request = UploadRequest {
            path: PART.into(),
            user: "bob".into(),
            content: b"other".to_vec(),
            revision: None,
            description: String::new(),
        };
        assert!(matches!(
            coordinator.upload(request.clone()).await.unwrap_err(),
            VaultError::AlreadyExists(_)
        ));

        request.path = "new.mcam".into();
        request.revision = Some("two".into());
        assert!(matches!(
            coordinator.upload(request.clone()).await.unwrap_err(),
            VaultError::InvalidArgument(_)
        ));

        request.revision = None;
        let meta = coordinator.upload(request).await.unwrap();
        assert_eq!(meta.revision, DEFAULT_UPLOAD_REVISION);
    }

    #[tokio::test]
    async fn test_upload_size_limit() {
        let remote = test_support::seeded_remote();
        let work = TempDir::new().unwrap();
        let mut config = test_support::config(&remote.url, work.path());
        config.max_upload_bytes = 4;
        let coordinator = Coordinator::open(config).unwrap();

        let err = coordinator
            .upload(UploadRequest {
                path: "big.mcam".into(),
                user: "alice".into(),
                content: vec![0; 5],
                revision: None,
                description: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_purge_stale_locks() {
        let remote = test_support::seeded_remote();
        let work = TempDir::new().unwrap();
        let mut config = test_support::config(&remote.url, work.path());
        config.lock_max_age = Duration::from_millis(1);
        let coordinator = Coordinator::open(config).unwrap();
        upload(&coordinator, PART, "alice", b"v1").await;
        coordinator.checkout(PART, "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = coordinator.purge_stale_locks().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(coordinator.list_locks().await.unwrap().is_empty());
        assert!(coordinator.purge_stale_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_notify_observers() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        upload(&coordinator, PART, "alice", b"v1").await;
        let (_id, mut rx) = coordinator.hub().register("bob");

        coordinator.checkout(PART, "alice").await.unwrap();
        match rx.recv().await.unwrap() {
            Notification::FileListChanged { groups } => {
                let file = &groups.iter().find(|g| g.key == "7654321").unwrap().files[0];
                assert_eq!(file.lock.as_ref().unwrap().user, "alice");
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Notification::LockChanged { locks } => assert_eq!(locks.len(), 1),
            other => panic!("unexpected notification: {other:?}"),
        }

        // Our own publish is already known to the monitor
        assert!(coordinator.poll_changes().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_sees_other_instance() {
        let remote = test_support::seeded_remote();
        let (a, _wa) = setup(&remote);
        let (b, _wb) = setup(&remote);

        assert!(b.poll_changes().await.unwrap().is_some());
        assert!(b.poll_changes().await.unwrap().is_none());

        upload(&a, PART, "alice", b"v1").await;
        let (_id, mut rx) = b.hub().register("carol");
        assert!(b.poll_and_notify().await.unwrap());
        assert_eq!(rx.recv().await.unwrap().kind(), "file_list_changed");
        assert_eq!(rx.recv().await.unwrap().kind(), "lock_changed");
        assert!(!b.poll_and_notify().await.unwrap());
    }

    #[tokio::test]
    async fn test_messages() {
        let remote = test_support::seeded_remote();
        let (coordinator, _work) = setup(&remote);
        let (_id, mut rx) = coordinator.hub().register("bob");

        coordinator
            .post_message("alice", "bob", "please check in the fixture")
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Notification::PendingMessages { user, messages } => {
                assert_eq!(user, "bob");
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].from, "alice");
            }
            other => panic!("unexpected notification: {other:?}"),
        }

        assert_eq!(coordinator.pending_messages("bob").await.unwrap().len(), 1);
        let taken = coordinator.take_messages("bob").await.unwrap();
        assert_eq!(taken[0].text, "please check in the fixture");
        assert!(coordinator.take_messages("bob").await.unwrap().is_empty());

        // Message traffic stays out of the activity feed
        assert!(coordinator.recent_activity(10).await.unwrap().is_empty());
        assert!(matches!(
            coordinator.post_message("alice", "bob", "  ").await.unwrap_err(),
            VaultError::InvalidArgument(_)
        ));
    }
}
