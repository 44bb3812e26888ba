//! Change detection and the background task that drives it.

mod monitor;
mod poller;

pub use monitor::{ChangeMonitor, Fingerprint};
pub use poller::spawn_change_poller;
