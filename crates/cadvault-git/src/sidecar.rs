use std::path::Path;

use cadvault_core::{Revision, RevisionMetadata, VaultError};
use tracing::warn;

use crate::paths::sidecar_path;

/// Read the metadata sidecar of `file` from the working copy.
///
/// Returns `None` when there is no sidecar. A sidecar that cannot be parsed,
/// or whose revision is malformed, degrades to default metadata with the
/// revision read as `0.0` instead of failing the caller.
pub fn read(root: &Path, file: &str) -> Result<Option<RevisionMetadata>, VaultError> {
    let path = root.join(sidecar_path(file));
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(VaultError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(Some(decode(file, &bytes)))
}

/// Decode sidecar bytes (from the working copy or a historical blob).
pub fn decode(file: &str, bytes: &[u8]) -> RevisionMetadata {
    let mut meta = match serde_json::from_slice::<RevisionMetadata>(bytes) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Malformed metadata for {}: {} (treating as 0.0)", file, e);
            return RevisionMetadata::default();
        }
    };
    if meta.revision.parse::<Revision>().is_err() {
        warn!(
            "Malformed revision '{}' for {} (treating as 0.0)",
            meta.revision, file
        );
        meta.revision = Revision::default().to_string();
    }
    meta
}

pub fn encode(meta: &RevisionMetadata) -> Result<Vec<u8>, VaultError> {
    let mut bytes = serde_json::to_vec_pretty(meta).map_err(|e| {
        VaultError::Serialization(format!("Failed to serialize metadata: {}", e))
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write the sidecar of `file`, returning its repository-relative path.
pub fn write(root: &Path, file: &str, meta: &RevisionMetadata) -> Result<String, VaultError> {
    let rel = sidecar_path(file);
    write_bytes(root, &rel, &encode(meta)?)?;
    Ok(rel)
}

/// Write bytes to a repository-relative path, creating parent directories.
pub fn write_bytes(root: &Path, rel: &str, data: &[u8]) -> Result<(), VaultError> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VaultError::Io(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    std::fs::write(&path, data)
        .map_err(|e| VaultError::Io(format!("Failed to write {}: {}", path.display(), e)))
}

/// Remove a repository-relative path. Returns whether it existed.
pub fn remove(root: &Path, rel: &str) -> Result<bool, VaultError> {
    let path = root.join(rel);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(VaultError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let meta = RevisionMetadata {
            description: "op20 fixture".into(),
            revision: "2.3".into(),
        };
        let rel = write(dir.path(), "parts/a.mcam", &meta).unwrap();
        assert_eq!(rel, "parts/a.mcam.meta.json");
        assert_eq!(read(dir.path(), "parts/a.mcam").unwrap(), Some(meta));
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read(dir.path(), "none.mcam").unwrap(), None);
        assert!(!remove(dir.path(), "none.mcam.meta.json").unwrap());
    }

    #[test]
    fn test_malformed_sidecar_degrades() {
        let dir = TempDir::new().unwrap();
        write_bytes(dir.path(), "a.mcam.meta.json", b"{not json").unwrap();
        let meta = read(dir.path(), "a.mcam").unwrap().unwrap();
        assert_eq!(meta.revision, "0.0");

        write_bytes(
            dir.path(),
            "b.mcam.meta.json",
            br#"{"description":"kept","revision":"v2"}"#,
        )
        .unwrap();
        let meta = read(dir.path(), "b.mcam").unwrap().unwrap();
        assert_eq!(meta.description, "kept");
        assert_eq!(meta.revision, "0.0");
    }
}
