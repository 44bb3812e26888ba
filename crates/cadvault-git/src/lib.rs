//! Git-backed checkout/checkin engine.
//!
//! A shared remote repository is the single source of truth for file
//! content, revision metadata and checkout state. Each instance keeps a local
//! working copy, serializes every operation through one gate and publishes
//! each change as one commit.
//!
//! Layout inside the repository:
//! - `<path>`: file content
//! - `<path>.meta.json`: `{description, revision}`
//! - `.locks/<url-encoded path>.lock`: active checkout
//! - `.messages/<url-encoded user>.json`: pending messages

pub mod config;
pub mod coordinator;
pub mod hub;
pub mod lock;
pub mod messages;
pub mod paths;
pub mod sidecar;
pub mod snapshot;
pub mod watch;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use coordinator::{CheckinRequest, Coordinator, UploadRequest, VaultState};
pub use hub::{NotificationHub, ObserverId};
pub use lock::LockStore;
pub use snapshot::{
    configure_network_timeouts, Git2Transport, RemoteTransport, RepositorySnapshot, TrackedFile,
};
pub use watch::{spawn_change_poller, ChangeMonitor};
