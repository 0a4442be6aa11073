//! On-disk image tree fixtures.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// PNG signature followed by a marker, enough to look like an image.
const PLACEHOLDER_PNG: &[u8] = b"\x89PNG\r\n\x1a\nevochain-fixture";

/// A directory of placeholder images.
#[derive(Debug, Clone)]
pub struct ImageTree {
    root: PathBuf,
}

impl ImageTree {
    /// Writes one placeholder image per relative path under `root`.
    pub fn create(root: impl Into<PathBuf>, relative_paths: &[&str]) -> io::Result<Self> {
        let tree = Self { root: root.into() };
        for relative in relative_paths {
            tree.add(relative)?;
        }
        Ok(tree)
    }

    /// The tree's root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes one more placeholder image, creating parent directories.
    pub fn add(&self, relative: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, PLACEHOLDER_PNG)?;
        Ok(path)
    }

    /// Every regular file below `dir`, relative to it, sorted.
    #[must_use]
    pub fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
            .collect();
        files.sort();
        files
    }
}
