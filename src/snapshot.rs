//! Index of files already present under the destination root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::mapper::normalize_prefixes;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[error("Snapshot task failed: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

/// Case-insensitive set of local file paths, fixed for one scan.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    paths: HashSet<String>,
}

/// Lower-cased string form used as the snapshot key.
pub fn normalize(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

impl LocalSnapshot {
    /// Walk `root`, or only `root/<prefix>` for each included prefix.
    ///
    /// Missing directories contribute nothing. Any other walk error fails the
    /// whole snapshot. Runs on the blocking pool.
    pub async fn scan(root: &Path, included_prefixes: &[String]) -> Result<Self, SnapshotError> {
        let roots: Vec<PathBuf> = if included_prefixes.is_empty() {
            vec![root.to_path_buf()]
        } else {
            normalize_prefixes(included_prefixes)
                .iter()
                .map(|prefix| {
                    prefix
                        .split('/')
                        .filter(|c| !c.is_empty())
                        .fold(root.to_path_buf(), |path, c| path.join(c))
                })
                .collect()
        };

        tokio::task::spawn_blocking(move || Self::walk(&roots)).await?
    }

    fn walk(roots: &[PathBuf]) -> Result<Self, SnapshotError> {
        let mut paths = HashSet::new();
        for root in roots {
            if !root.is_dir() {
                tracing::debug!(root = %root.display(), "Snapshot root missing, treating as empty");
                continue;
            }
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(|source| SnapshotError::Walk {
                    root: root.clone(),
                    source,
                })?;
                if entry.file_type().is_file() {
                    paths.insert(normalize(entry.path()));
                }
            }
        }
        Ok(Self { paths })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Every indexed path, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.paths.iter().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

#[cfg(test)]
impl LocalSnapshot {
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Self {
        Self {
            paths: paths.into_iter().map(normalize).collect(),
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Make `dir` unreadable. False when the process can read it anyway
    /// (running as root), in which case the caller skips.
    pub fn lock_dir(dir: &Path) -> bool {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o000)).unwrap();
        std::fs::read_dir(dir).is_err()
    }

    pub fn unlock_dir(dir: &Path) {
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
