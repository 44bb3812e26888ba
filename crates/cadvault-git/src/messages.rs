use std::path::Path;

use cadvault_core::{UserMessage, VaultError};
use tracing::warn;

use crate::paths::MESSAGE_DIR;
use crate::sidecar;

/// Repository-relative path of a user's pending message queue.
pub fn queue_path(user: &str) -> String {
    format!("{}/{}.json", MESSAGE_DIR, urlencoding::encode(user))
}

/// Messages waiting for `user`, oldest first.
pub fn pending(root: &Path, user: &str) -> Result<Vec<UserMessage>, VaultError> {
    let path = root.join(queue_path(user));
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(VaultError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(messages) => Ok(messages),
        Err(e) => {
            warn!("Discarding malformed message queue for {}: {}", user, e);
            Ok(vec![])
        }
    }
}

/// Append `message` to the queue of `recipient`, returning the queue path.
pub fn append(root: &Path, recipient: &str, message: UserMessage) -> Result<String, VaultError> {
    let mut queue = pending(root, recipient)?;
    queue.push(message);
    let rel = queue_path(recipient);
    let mut bytes = serde_json::to_vec_pretty(&queue).map_err(|e| {
        VaultError::Serialization(format!("Failed to serialize messages: {}", e))
    })?;
    bytes.push(b'\n');
    sidecar::write_bytes(root, &rel, &bytes)?;
    Ok(rel)
}

/// Empty the queue of `user`. Returns whether there was one.
pub fn clear(root: &Path, user: &str) -> Result<bool, VaultError> {
    sidecar::remove(root, &queue_path(user))
}
