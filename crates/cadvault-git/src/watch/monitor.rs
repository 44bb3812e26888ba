use cadvault_core::VaultError;
use tracing::debug;

use crate::lock::LockStore;
use crate::snapshot::RepositorySnapshot;

/// What the monitor compares between observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Remote tip, `None` while the branch is unborn
    pub tip: Option<String>,
    /// Digest of all active lock records
    pub lock_digest: String,
}

/// Detects whether the remote tip or the lock set moved since the last look.
///
/// The very first observation reports a change so that observers get an
/// initial state.
#[derive(Debug, Default)]
pub struct ChangeMonitor {
    last: Option<Fingerprint>,
}

impl ChangeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&Fingerprint> {
        self.last.as_ref()
    }

    /// Record `current`, returning whether it differs from the previous one.
    pub fn observe(&mut self, current: Fingerprint) -> bool {
        let changed = self.last.as_ref() != Some(&current);
        if changed {
            debug!(
                "Change observed: tip {:?}, locks {}",
                current.tip, current.lock_digest
            );
        }
        self.last = Some(current);
        changed
    }

    /// Fingerprint the working copy as it stands, without syncing.
    pub fn fingerprint(
        snapshot: &RepositorySnapshot,
        locks: &LockStore,
    ) -> Result<Fingerprint, VaultError> {
        Ok(Fingerprint {
            tip: snapshot.tip_id(),
            lock_digest: locks.digest()?,
        })
    }

    /// Sync with the remote, then report whether anything changed.
    pub fn poll(
        &mut self,
        snapshot: &mut RepositorySnapshot,
        locks: &LockStore,
    ) -> Result<bool, VaultError> {
        snapshot.ensure_up_to_date()?;
        self.refresh(snapshot, locks)
    }

    /// Re-fingerprint after a local publish.
    pub fn refresh(
        &mut self,
        snapshot: &RepositorySnapshot,
        locks: &LockStore,
    ) -> Result<bool, VaultError> {
        let current = Self::fingerprint(snapshot, locks)?;
        Ok(self.observe(current))
    }
}
