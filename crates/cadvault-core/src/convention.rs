//! Commit-message convention.
//!
//! Every published mutation carries a subject line of the form
//!
//! ```text
//! <PREFIX>: <target>[ rev <revision>] by <actor>
//! ```
//!
//! optionally followed by a blank line and a free-text body. The activity
//! feed and file histories are rebuilt by parsing these subjects, so the
//! prefixes below are a persisted format and must not change.

use serde::{Deserialize, Serialize};

use crate::revision::Revision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Checkout,
    Checkin,
    Cancel,
    Override,
    Delete,
    Revert,
    Purge,
    Message,
    MessageRead,
}

impl OperationKind {
    pub const ALL: [OperationKind; 10] = [
        OperationKind::Upload,
        OperationKind::Checkout,
        OperationKind::Checkin,
        OperationKind::Cancel,
        OperationKind::Override,
        OperationKind::Delete,
        OperationKind::Revert,
        OperationKind::Purge,
        OperationKind::Message,
        OperationKind::MessageRead,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            OperationKind::Upload => "UPLOAD",
            OperationKind::Checkout => "LOCK",
            OperationKind::Checkin => "CHECKIN",
            OperationKind::Cancel => "UNLOCK",
            OperationKind::Override => "OVERRIDE",
            OperationKind::Delete => "DELETE",
            OperationKind::Revert => "REVERT",
            OperationKind::Purge => "PURGE",
            OperationKind::Message => "MESSAGE",
            OperationKind::MessageRead => "READ",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }

    /// Operations that act on a single file (shown in the activity feed).
    pub fn is_file_operation(&self) -> bool {
        !matches!(
            self,
            OperationKind::Purge | OperationKind::Message | OperationKind::MessageRead
        )
    }
}

/// Parsed subject line of a conventional commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSubject {
    pub kind: OperationKind,
    /// File path, or recipient for message operations
    pub target: String,
    pub revision: Option<String>,
    pub actor: String,
}

impl CommitSubject {
    pub fn new(kind: OperationKind, target: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            revision: None,
            actor: actor.into(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn format(&self) -> String {
        match &self.revision {
            Some(rev) => format!(
                "{}: {} rev {} by {}",
                self.kind.prefix(),
                self.target,
                rev,
                self.actor
            ),
            None => format!("{}: {} by {}", self.kind.prefix(), self.target, self.actor),
        }
    }

    /// Full commit message: subject, then the body after a blank line.
    pub fn message(&self, body: &str) -> String {
        let body = body.trim();
        if body.is_empty() {
            self.format()
        } else {
            format!("{}\n\n{}", self.format(), body)
        }
    }

    /// Parse a subject line. Returns `None` for anything off-convention.
    pub fn parse(subject: &str) -> Option<Self> {
        let (prefix, rest) = subject.trim().split_once(": ")?;
        let kind = OperationKind::from_prefix(prefix)?;
        let (rest, actor) = rest.rsplit_once(" by ")?;
        if actor.is_empty() {
            return None;
        }

        let (target, revision) = match rest.rsplit_once(" rev ") {
            Some((target, rev)) if rev.parse::<Revision>().is_ok() => {
                (target, Some(rev.to_string()))
            }
            _ => (rest, None),
        };
        if target.is_empty() {
            return None;
        }

        Some(Self {
            kind,
            target: target.to_string(),
            revision,
            actor: actor.to_string(),
        })
    }
}

/// Split a commit message into its subject line and trimmed body.
pub fn split_message(message: &str) -> (&str, &str) {
    match message.split_once('\n') {
        Some((subject, body)) => (subject.trim(), body.trim()),
        None => (message.trim(), ""),
    }
}
