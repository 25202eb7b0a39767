//! Filesystem layer under the LRU index
//!
//! Owns the actual cache files: atomic writes, removal, and pruning of the
//! directory skeleton left behind by evicted entries. Pruning walks upward
//! from the removed file but never past the cache root.

use std::io;
use std::path::Path;

/// Write `data` to `path`, creating parent directories. The write goes to a
/// temporary sibling first and is renamed into place so a crash mid-write
/// never leaves a half-written entry under the final name.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Remove a cache file and prune now-empty parent directories up to but not
/// including `cache_root`. Removal failure is logged before it is returned;
/// the cache would otherwise silently fill with untracked files.
pub fn remove_entry_file(path: &Path, cache_root: &Path) -> io::Result<()> {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::error!("unable to remove cache file {}: {e}", path.display());
        return Err(e);
    }
    prune_empty_parents(path, cache_root);
    Ok(())
}

/// Best-effort cleanup of a partially written entry. Used when an `add`
/// fails after the file write began.
pub fn discard_partial(path: &Path) {
    let _ = std::fs::remove_file(path.with_extension("tmp"));
    let _ = std::fs::remove_file(path);
}

fn prune_empty_parents(path: &Path, cache_root: &Path) {
    let mut directory = path.parent();
    while let Some(dir) = directory {
        if dir == cache_root {
            return;
        }
        match std::fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return;
                }
            }
            Err(_) => return,
        }
        if std::fs::remove_dir(dir).is_err() {
            return;
        }
        directory = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_parents() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("xul.pdb/44E4/xul.sym");
        write_atomic(&path, b"DiskCache v.1\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"DiskCache v.1\n");
    }

    #[test]
    fn test_remove_prunes_empty_dirs_up_to_root() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("xul.pdb/44E4/xul.sym");
        write_atomic(&path, b"data").unwrap();

        remove_entry_file(&path, root.path()).unwrap();

        assert!(!root.path().join("xul.pdb").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_remove_keeps_shared_dirs() {
        let root = tempfile::tempdir().unwrap();
        let first = root.path().join("xul.pdb/44E4/xul.sym");
        let second = root.path().join("xul.pdb/55F5/xul.sym");
        write_atomic(&first, b"one").unwrap();
        write_atomic(&second, b"two").unwrap();

        remove_entry_file(&first, root.path()).unwrap();

        assert!(!root.path().join("xul.pdb/44E4").exists());
        assert!(second.exists());
    }

    #[test]
    fn test_remove_missing_file_errors() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("absent.sym");
        assert!(remove_entry_file(&path, root.path()).is_err());
    }
}
