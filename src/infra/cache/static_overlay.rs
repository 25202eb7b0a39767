//! Read-only symbol directory overlay
//!
//! Deployments can ship symbol files in local directories that are consulted
//! before the LRU cache. The overlay is built once at startup; the files are
//! externally owned and never evicted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct StaticOverlay {
    entries: HashMap<PathBuf, PathBuf>,
}

impl StaticOverlay {
    /// Walk the configured directories and map relative symbol paths to
    /// their absolute locations. Directories are loaded in reverse order so
    /// entries from directories listed earlier overwrite later ones.
    pub fn load(dirs: &[PathBuf]) -> Self {
        let mut entries = HashMap::new();
        for dir in dirs.iter().rev() {
            for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel_path) = entry.path().strip_prefix(dir) else {
                    continue;
                };
                entries.insert(rel_path.to_path_buf(), entry.path().to_path_buf());
            }
        }
        if !entries.is_empty() {
            tracing::info!("static symbol overlay holds {} files", entries.len());
        }
        Self { entries }
    }

    pub fn get(&self, rel_path: &Path) -> Option<&Path> {
        self.entries.get(rel_path).map(PathBuf::as_path)
    }

    pub fn contains(&self, rel_path: &Path) -> bool {
        self.entries.contains_key(rel_path)
    }
}
