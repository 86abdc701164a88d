//! Filesystem helpers: change-suppressing writes and traversal-safe paths.

use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Write `content` to `path` only when it differs byte-for-byte from the
/// current file content. Returns whether a write happened.
///
/// # Errors
///
/// Returns an error when the existing file cannot be read (other than
/// not existing) or the write fails; the file is never partially written
/// over readable content without the full new content.
pub fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool> {
    match std::fs::read(path) {
        Ok(current) if current == content => {
            debug!("unchanged, skipping write: {}", path.display());
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow!("reading {}: {e}", path.display())),
    }
    std::fs::write(path, content).map_err(|e| anyhow!("writing {}: {e}", path.display()))?;
    Ok(true)
}

/// Join a relative path onto a root, refusing traversal above the root.
///
/// # Errors
///
/// Returns an error when the path would escape `root` or carries
/// unsupported components.
pub fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    let mut result = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(p) => result.push(p),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() || !result.starts_with(root) {
                    return Err(anyhow!("path traversal detected: {path}"));
                }
            }
            Component::Prefix(_) => {
                return Err(anyhow!("unsupported path prefix: {path}"));
            }
        }
    }
    Ok(result)
}

/// A single path component suitable for config-file CRUD: no separators,
/// no parent references, not empty, not hidden.
#[must_use]
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_if_changed_suppresses_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        assert!(write_if_changed(&path, b"abc").unwrap());
        assert!(!write_if_changed(&path, b"abc").unwrap());
        assert!(write_if_changed(&path, b"abcd").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[test]
    fn test_safe_join() {
        let root = PathBuf::from("/work");
        assert_eq!(safe_join(&root, "apps/foo").unwrap(), root.join("apps/foo"));
        assert_eq!(safe_join(&root, "apps/../bar").unwrap(), root.join("bar"));
        assert!(safe_join(&root, "../etc/passwd").is_err());
        assert!(safe_join(&root, "apps/../../etc").is_err());
    }

    #[test]
    fn test_safe_filename() {
        assert!(is_safe_filename("app.conf"));
        assert!(!is_safe_filename("../app.conf"));
        assert!(!is_safe_filename("a/b"));
        assert!(!is_safe_filename("a\\b"));
        assert!(!is_safe_filename(".hidden"));
        assert!(!is_safe_filename(""));
    }
}
