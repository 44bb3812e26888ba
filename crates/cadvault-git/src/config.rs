use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use cadvault_core::Identity;

/// Settings the engine consumes. Built by the front end from its own
/// configuration sources and handed to `Coordinator::open`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// URL (or local path) of the shared remote repository
    pub remote_url: String,
    /// Token presented as the HTTPS password, if any
    pub credential: Option<String>,
    /// Branch holding files and lock state
    pub branch: String,
    /// Local working copy
    pub work_dir: PathBuf,
    /// Users allowed to override, delete and revert
    pub admins: BTreeSet<String>,
    pub poll_interval: Duration,
    /// Locks older than this are removed by maintenance
    pub lock_max_age: Duration,
    pub maintenance_interval: Duration,
    pub max_upload_bytes: u64,
    /// Bound on each fetch or push
    pub network_timeout: Duration,
    /// Allowance for local git work on top of one fetch and one push
    pub local_work_allowance: Duration,
    /// Committer recorded on every commit (authors are the acting users)
    pub committer: Identity,
}

impl EngineConfig {
    pub fn new(remote_url: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_url: remote_url.into(),
            credential: None,
            branch: "main".to_string(),
            work_dir: work_dir.into(),
            admins: BTreeSet::new(),
            poll_interval: Duration::from_secs(15),
            lock_max_age: Duration::from_secs(72 * 3600),
            maintenance_interval: Duration::from_secs(3600),
            max_upload_bytes: 200 * 1024 * 1024,
            network_timeout: Duration::from_secs(30),
            local_work_allowance: Duration::from_secs(10),
            committer: Identity::new("cadvault", "cadvault@localhost"),
        }
    }

    pub fn with_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admins = admins.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    /// Upper bound for one gated operation, waiting for the gate included:
    /// a fetch, a push, plus local work.
    pub fn operation_timeout(&self) -> Duration {
        self.network_timeout * 2 + self.local_work_allowance
    }
}
