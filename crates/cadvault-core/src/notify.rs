use serde::{Deserialize, Serialize};

use crate::model::{FileGroup, LockSummary, UserMessage};

/// Event pushed to observers.
///
/// Shared state changes are broadcast to every observer; `PendingMessages`
/// is only ever sent to the observers of the addressed user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Full current grouped file list
    FileListChanged { groups: Vec<FileGroup> },
    /// Full current set of active checkouts
    LockChanged { locks: Vec<LockSummary> },
    /// Messages queued for one user
    PendingMessages {
        user: String,
        messages: Vec<UserMessage>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::FileListChanged { .. } => "file_list_changed",
            Notification::LockChanged { .. } => "lock_changed",
            Notification::PendingMessages { .. } => "pending_messages",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let json = serde_json::to_value(Notification::LockChanged { locks: vec![] }).unwrap();
        assert_eq!(json["type"], "lock_changed");
        assert!(json["locks"].as_array().unwrap().is_empty());

        let event = Notification::PendingMessages {
            user: "alice".into(),
            messages: vec![],
        };
        assert_eq!(event.kind(), "pending_messages");
    }
}
