use std::path::{Path, PathBuf};
use std::time::Duration;

use cadvault_core::{LockRecord, VaultError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::paths::LOCK_DIR;
use crate::sidecar;

/// Owner reported for a lock record that exists but cannot be parsed.
pub const UNKNOWN_OWNER: &str = "<unknown>";

/// Lock records kept as files inside the working copy.
///
/// Each checked-out file has exactly one record at
/// `{root}/.locks/{url-encoded path}.lock`, so lock state travels with the
/// repository and becomes durable only when the coordinator publishes the
/// record path. The store itself never touches the network.
#[derive(Debug, Clone)]
pub struct LockStore {
    root: PathBuf,
}

impl LockStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Repository-relative path of the record for `file`.
    pub fn record_path(file: &str) -> String {
        format!("{}/{}.lock", LOCK_DIR, urlencoding::encode(file))
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    fn read_record(&self, rel: &str, fallback_file: &str) -> Result<Option<LockRecord>, VaultError> {
        let path = self.root.join(rel);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VaultError::Io(format!(
                    "Failed to read lock {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Still a lock: keep the file unavailable until maintenance clears it
                warn!("Malformed lock record {}: {}", rel, e);
                Ok(Some(LockRecord {
                    file: fallback_file.to_string(),
                    user: UNKNOWN_OWNER.to_string(),
                    acquired_at: DateTime::<Utc>::default(),
                }))
            }
        }
    }

    fn write_record(&self, record: &LockRecord) -> Result<String, VaultError> {
        let rel = Self::record_path(&record.file);
        let mut bytes = serde_json::to_vec_pretty(record).map_err(|e| {
            VaultError::Serialization(format!("Failed to serialize lock record: {}", e))
        })?;
        bytes.push(b'\n');
        sidecar::write_bytes(&self.root, &rel, &bytes)?;
        Ok(rel)
    }

    pub fn get(&self, file: &str) -> Result<Option<LockRecord>, VaultError> {
        self.read_record(&Self::record_path(file), file)
    }

    /// Take the lock on `file` for `user`.
    ///
    /// A lock already held by `user` has its timestamp refreshed; a lock held
    /// by anyone else fails with `AlreadyLocked`.
    #[instrument(skip(self), level = "debug")]
    pub fn acquire(
        &self,
        file: &str,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<LockRecord, VaultError> {
        if let Some(existing) = self.get(file)? {
            if existing.user != user {
                return Err(VaultError::AlreadyLocked {
                    path: file.to_string(),
                    owner: existing.user,
                });
            }
            debug!("Refreshing lock on {} for {}", file, user);
        }

        let record = LockRecord {
            file: file.to_string(),
            user: user.to_string(),
            acquired_at: now,
        };
        self.write_record(&record)?;
        Ok(record)
    }

    /// Remove the record for `file`. Ownership is checked by the caller.
    pub fn release(&self, file: &str) -> Result<bool, VaultError> {
        let removed = sidecar::remove(&self.root, &Self::record_path(file))?;
        if removed {
            debug!("Released lock on {}", file);
        }
        Ok(removed)
    }

    /// Every record in the store, sorted by file.
    pub fn all_active(&self) -> Result<Vec<LockRecord>, VaultError> {
        let dir = self.locks_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(VaultError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| VaultError::Io(format!("Failed to read dir entry: {}", e)))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(encoded) = name.strip_suffix(".lock") else {
                continue;
            };
            let file = urlencoding::decode(encoded)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| encoded.to_string());
            let rel = format!("{}/{}", LOCK_DIR, name);
            if let Some(record) = self.read_record(&rel, &file)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.file.cmp(&b.file));
        Ok(records)
    }

    /// Remove records older than `max_age`, returning the removed records.
    #[instrument(skip(self), level = "debug")]
    pub fn purge_stale(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<LockRecord>, VaultError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| VaultError::InvalidArgument(format!("Invalid lock max age: {}", e)))?;

        let mut removed = Vec::new();
        for record in self.all_active()? {
            if now - record.acquired_at > max_age {
                self.release(&record.file)?;
                removed.push(record);
            }
        }
        if !removed.is_empty() {
            debug!("Purged {} stale locks", removed.len());
        }
        Ok(removed)
    }

    /// SHA-256 over the full set of active records.
    pub fn digest(&self) -> Result<String, VaultError> {
        let records = self.all_active()?;
        let mut hasher = Sha256::new();
        for record in &records {
            hasher.update(record.file.as_bytes());
            hasher.update([0u8]);
            hasher.update(record.user.as_bytes());
            hasher.update([0u8]);
            hasher.update(record.acquired_at.to_rfc3339().as_bytes());
            hasher.update([b'\n']);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
