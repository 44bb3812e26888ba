//! Layout of the working copy and validation of caller-supplied paths.

use std::path::{Component, Path};

use cadvault_core::VaultError;

/// Directory holding one record per checked-out file
pub const LOCK_DIR: &str = ".locks";
/// Directory holding one message queue per user
pub const MESSAGE_DIR: &str = ".messages";
/// Suffix of the metadata sidecar next to each file
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Whether a repository path belongs to the engine's own bookkeeping.
pub fn is_internal(path: &str) -> bool {
    let first = path.split('/').next().unwrap_or(path);
    first == ".git"
        || first == LOCK_DIR
        || first == MESSAGE_DIR
        || path.ends_with(SIDECAR_SUFFIX)
        || first.starts_with(".git")
}

/// Normalize and check a caller-supplied file path.
///
/// Accepts relative `/`-separated paths (backslashes are converted) without
/// empty, `.` or `..` components that do not address internal files.
pub fn validate_repo_path(path: &str) -> Result<String, VaultError> {
    let normalized = path.trim().replace('\\', "/");
    let normalized = normalized.trim_start_matches("./").to_string();
    let invalid = |reason: &str| {
        VaultError::InvalidArgument(format!("invalid path '{}': {}", path, reason))
    };

    if normalized.is_empty() {
        return Err(invalid("empty"));
    }
    // Paths end up in commit subjects, which must stay on one line
    if normalized.chars().any(char::is_control) {
        return Err(invalid("contains control characters"));
    }
    if normalized.starts_with('/') || Path::new(&normalized).is_absolute() {
        return Err(invalid("must be relative"));
    }
    if normalized.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(invalid("contains empty or relative components"));
    }
    if Path::new(&normalized)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(invalid("contains non-normal components"));
    }
    if is_internal(&normalized) {
        return Err(invalid("reserved location"));
    }
    Ok(normalized)
}

/// Sidecar path for a file.
pub fn sidecar_path(file: &str) -> String {
    format!("{}{}", file, SIDECAR_SUFFIX)
}
