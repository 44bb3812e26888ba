use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::convention::OperationKind;

/// Name and email recorded on commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Identity for an end user that has no configured email.
    pub fn for_user(user: &str) -> Self {
        Self {
            name: user.to_string(),
            email: format!("{}@cadvault.local", user),
        }
    }
}

/// An active checkout on a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Repository-relative path of the locked file
    pub file: String,
    /// User holding the checkout
    pub user: String,
    pub acquired_at: DateTime<Utc>,
}

/// Content of a metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_revision")]
    pub revision: String,
}

fn default_revision() -> String {
    "0.0".to_string()
}

impl Default for RevisionMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            revision: default_revision(),
        }
    }
}

/// A tracked file together with its metadata and lock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub description: String,
    pub revision: String,
    pub lock: Option<LockRecord>,
}

impl FileRecord {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Files sharing a group key (usually the part number prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileGroup {
    pub key: String,
    pub files: Vec<FileRecord>,
}

/// Group key of a path: the file stem up to the first `_`.
///
/// `parts/7654321_AB1.mcam` groups under `7654321`.
pub fn group_key(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    stem.split('_').next().unwrap_or(stem).to_string()
}

/// Group records by `group_key`, groups and members sorted by key and path.
pub fn group_files(records: Vec<FileRecord>) -> Vec<FileGroup> {
    let mut groups: BTreeMap<String, Vec<FileRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(&record.path)).or_default().push(record);
    }
    groups
        .into_iter()
        .map(|(key, mut files)| {
            files.sort_by(|a, b| a.path.cmp(&b.path));
            FileGroup { key, files }
        })
        .collect()
}

/// One entry of the audit log, reconstructed from repository history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub commit_id: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    /// `None` when the commit message does not follow the convention
    pub kind: Option<OperationKind>,
    pub file: Option<String>,
    pub revision: Option<String>,
    /// Free-text message (commit body, or the full message when unparsed)
    pub message: String,
}

/// Lock record plus how long it has been held, for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSummary {
    pub file: String,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
    pub held_for_secs: i64,
}

impl LockSummary {
    pub fn from_record(record: LockRecord, now: DateTime<Utc>) -> Self {
        let held_for_secs = (now - record.acquired_at).num_seconds().max(0);
        Self {
            file: record.file,
            user: record.user,
            acquired_at: record.acquired_at,
            held_for_secs,
        }
    }
}

/// A message waiting in a user's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub from: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_bytes: 0,
            modified_at: Utc::now(),
            description: String::new(),
            revision: "1.0".into(),
            lock: None,
        }
    }

    #[test]
    fn test_group_key() {
        assert_eq!(group_key("7654321_AB1.mcam"), "7654321");
        assert_eq!(group_key("parts/7654321_OP20.mcam"), "7654321");
        assert_eq!(group_key("fixture.mcam"), "fixture");
        assert_eq!(group_key(".hidden"), ".hidden");
    }

    #[test]
    fn test_group_files() {
        let groups = group_files(vec![
            record("7654321_OP20.mcam"),
            record("1111111_A.mcam"),
            record("7654321_AB1.mcam"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, "1111111");
        assert_eq!(groups[1].key, "7654321");
        assert_eq!(groups[1].files[0].path, "7654321_AB1.mcam");
        assert_eq!(groups[1].files[1].file_name(), "7654321_OP20.mcam");
    }

    #[test]
    fn test_metadata_defaults() {
        let meta: RevisionMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta.revision, "0.0");
        assert!(meta.description.is_empty());
    }

    #[test]
    fn test_lock_summary_duration() {
        let now = Utc::now();
        let summary = LockSummary::from_record(
            LockRecord {
                file: "a.mcam".into(),
                user: "alice".into(),
                acquired_at: now - chrono::Duration::seconds(90),
            },
            now,
        );
        assert_eq!(summary.held_for_secs, 90);
    }
}
