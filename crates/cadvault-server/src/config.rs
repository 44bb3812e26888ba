use std::path::PathBuf;
use std::time::Duration;

use cadvault_core::Identity;
use cadvault_git::EngineConfig;
use clap::Parser;

/// Configuration for the cadvault server.
#[derive(Parser, Debug, Clone)]
#[command(name = "cadvault-server")]
#[command(about = "Git-backed checkout/checkin server for shared CAD files")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "CADVAULT_HOST")]
    pub host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080", env = "CADVAULT_PORT")]
    pub port: u16,

    /// URL (or local path) of the shared repository
    #[arg(long, env = "CADVAULT_REMOTE_URL")]
    pub remote_url: String,

    /// Access token used as the HTTPS password
    #[arg(long, env = "CADVAULT_CREDENTIAL", hide_env_values = true)]
    pub credential: Option<String>,

    /// Branch holding files and checkout state
    #[arg(long, default_value = "main", env = "CADVAULT_BRANCH")]
    pub branch: String,

    /// Local working copy (default: <data dir>/cadvault/repo)
    #[arg(long, env = "CADVAULT_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Comma-separated admin user names
    #[arg(long, env = "CADVAULT_ADMINS", value_delimiter = ',')]
    pub admins: Vec<String>,

    /// Seconds between remote change polls
    #[arg(long, default_value = "15", env = "CADVAULT_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: u64,

    /// Checkouts older than this are purged by maintenance
    #[arg(long, default_value = "72", env = "CADVAULT_LOCK_MAX_AGE_HOURS")]
    pub lock_max_age_hours: u64,

    /// Seconds between maintenance runs
    #[arg(long, default_value = "3600", env = "CADVAULT_MAINTENANCE_INTERVAL_SECS")]
    pub maintenance_interval_secs: u64,

    /// Largest accepted upload or check-in, in MiB
    #[arg(long, default_value = "200", env = "CADVAULT_MAX_UPLOAD_MB")]
    pub max_upload_mb: u64,

    /// Timeout for each fetch or push
    #[arg(long, default_value = "30", env = "CADVAULT_NETWORK_TIMEOUT_SECS")]
    pub network_timeout_secs: u64,

    #[arg(long, default_value = "cadvault", env = "CADVAULT_COMMITTER_NAME")]
    pub committer_name: String,

    #[arg(long, default_value = "cadvault@localhost", env = "CADVAULT_COMMITTER_EMAIL")]
    pub committer_email: String,
}

impl Config {
    pub fn resolve_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cadvault")
                .join("repo")
        })
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.remote_url.clone(), self.resolve_work_dir())
            .with_admins(
                self.admins
                    .iter()
                    .map(|a| a.trim())
                    .filter(|a| !a.is_empty()),
            );
        config.credential = self.credential.clone().filter(|c| !c.is_empty());
        config.branch = self.branch.clone();
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.lock_max_age = Duration::from_secs(self.lock_max_age_hours.saturating_mul(3600));
        config.maintenance_interval = Duration::from_secs(self.maintenance_interval_secs);
        config.max_upload_bytes = self.max_upload_bytes();
        config.network_timeout = Duration::from_secs(self.network_timeout_secs);
        config.committer = Identity::new(self.committer_name.clone(), self.committer_email.clone());
        config
    }
}
