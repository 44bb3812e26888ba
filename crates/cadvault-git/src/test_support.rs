//! Fixtures shared by the engine's unit tests: bare remotes on disk and a
//! transport that can be told to reject pushes or stall fetches.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadvault_core::VaultError;
use git2::{Repository, Signature};
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::snapshot::{Git2Transport, RemoteTransport, RepositorySnapshot};

pub const SEED_FILE: &str = "README.md";
pub const SEED_CONTENT: &[u8] = b"shared CAD vault\n";
pub const SEED_AUTHOR: &str = "seed";

pub struct TestRemote {
    _dir: TempDir,
    pub url: String,
}

/// Bare repository with no commits.
pub fn empty_remote() -> TestRemote {
    let dir = TempDir::new().unwrap();
    Repository::init_bare(dir.path()).unwrap();
    let url = dir.path().to_string_lossy().to_string();
    TestRemote { _dir: dir, url }
}

/// Bare repository whose `main` holds one commit adding [`SEED_FILE`].
pub fn seeded_remote() -> TestRemote {
    let remote = empty_remote();
    seed(Path::new(&remote.url));
    remote
}

fn seed(path: &Path) {
    let repo = Repository::open_bare(path).unwrap();
    let blob = repo.blob(SEED_CONTENT).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder.insert(SEED_FILE, blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = Signature::now(SEED_AUTHOR, "seed@example.com").unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "seed", &tree, &[])
        .unwrap();
}

pub fn transport() -> Git2Transport {
    Git2Transport::new(None, Duration::from_secs(10))
}

pub fn snapshot(url: &str) -> (RepositorySnapshot, TempDir) {
    snapshot_with(url, Box::new(transport()))
}

pub fn snapshot_with(
    url: &str,
    transport: Box<dyn RemoteTransport>,
) -> (RepositorySnapshot, TempDir) {
    let work = TempDir::new().unwrap();
    let snapshot = RepositorySnapshot::open(work.path(), url, "main", transport).unwrap();
    (snapshot, work)
}

pub fn config(url: &str, work: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(url, work).with_admins(["admin"]);
    config.network_timeout = Duration::from_secs(10);
    config
}

/// Real transport that rejects a configurable number of pushes with
/// `Conflict`, as if another instance had published first, and can stall
/// the next fetch like a slow remote.
#[derive(Clone)]
pub struct FaultyTransport {
    inner: Git2Transport,
    pending_rejections: Arc<AtomicUsize>,
    fetch_delay: Arc<Mutex<Option<Duration>>>,
}

impl FaultyTransport {
    pub fn new() -> Self {
        Self {
            inner: transport(),
            pending_rejections: Arc::new(AtomicUsize::new(0)),
            fetch_delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stall_next_fetch(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn reject_next_push(&self) {
        self.pending_rejections.fetch_add(1, Ordering::SeqCst);
    }
}

impl RemoteTransport for FaultyTransport {
    fn fetch(&self, repo: &Repository, branch: &str) -> Result<(), VaultError> {
        let delay = self.fetch_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.fetch(repo, branch)
    }

    fn push(&self, repo: &Repository, branch: &str) -> Result<(), VaultError> {
        let rejected = self
            .pending_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(VaultError::Conflict("injected push rejection".into()));
        }
        self.inner.push(repo, branch)
    }
}
