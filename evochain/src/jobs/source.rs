//! Input enumeration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::naming::{base_stem, generation_key, is_generated};
use crate::errors::PreconditionError;

/// Identity of an image across every stage of a chain.
///
/// Made of the directory relative to the stage input root and the base
/// stem of the file name, so `cat/dog.png` and
/// `cat/dog_generated_20250101_120000.png` share an identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct JobId {
    relative_dir: PathBuf,
    base: String,
}

impl JobId {
    /// Creates an identity from its parts.
    #[must_use]
    pub fn new(relative_dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            relative_dir: relative_dir.into(),
            base: base.into(),
        }
    }

    /// Derives the identity of a file given its path relative to the input root.
    #[must_use]
    pub fn from_relative_path(relative: &Path) -> Option<Self> {
        let stem = relative.file_stem()?.to_str()?;
        let dir = relative.parent().unwrap_or_else(|| Path::new(""));
        Some(Self::new(dir, base_stem(stem)))
    }

    /// Directory relative to the stage input root.
    #[must_use]
    pub fn relative_dir(&self) -> &Path {
        &self.relative_dir
    }

    /// Base stem shared by every generation of this image.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in self.relative_dir.components() {
            if let Component::Normal(part) = component {
                write!(f, "{}/", part.to_string_lossy())?;
            }
        }
        write!(f, "{}", self.base)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for JobId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (dir, base) = value.rsplit_once('/').unwrap_or(("", value.as_str()));
        if base.is_empty() {
            return Err(format!("job id `{value}` has an empty base name"));
        }
        Ok(Self::new(dir, base))
    }
}

/// An input file found by [`JobSource::discover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute (or root-joined) path to the file.
    pub path: PathBuf,
    /// Path relative to the root it was found under.
    pub relative_path: PathBuf,
}

impl SourceFile {
    /// Wraps a file already attributed to `id`, keeping it under the
    /// identity's relative directory.
    #[must_use]
    pub fn for_job(id: &JobId, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            relative_path: id.relative_dir().join(path.file_name().unwrap_or_default()),
        }
    }

    fn stem(&self) -> &str {
        self.path.file_stem().and_then(|s| s.to_str()).unwrap_or_default()
    }

    fn is_generated(&self) -> bool {
        is_generated(self.stem())
    }

    fn generation(&self) -> (Option<(&str, u32)>, &Path) {
        (generation_key(self.stem()), &self.relative_path)
    }
}

/// One unit of work: one image within one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Position in the stage's ordered job sequence.
    pub index: usize,
    /// Identity, stable across stages.
    pub id: JobId,
    /// File to read.
    pub source: PathBuf,
    /// Source path relative to the input root.
    pub relative_path: PathBuf,
    /// Stage ordinal (0 for single-stage batch runs).
    pub stage: u32,
}

impl JobDescriptor {
    /// Worker slot this job belongs to in a pool of `worker_count`.
    #[must_use]
    pub fn worker_for(&self, worker_count: usize) -> usize {
        self.index % worker_count.max(1)
    }
}

/// Assigns indexes to discovered files in identity order.
#[must_use]
pub fn index_jobs(stage: u32, files: BTreeMap<JobId, SourceFile>) -> Vec<JobDescriptor> {
    files
        .into_iter()
        .enumerate()
        .map(|(index, (id, file))| JobDescriptor {
            index,
            id,
            source: file.path,
            relative_path: file.relative_path,
            stage,
        })
        .collect()
}

/// Enumerates supported images under a root directory.
#[derive(Debug, Clone)]
pub struct JobSource {
    root: PathBuf,
    recursive: bool,
    extensions: Vec<String>,
    excluded: Vec<PathBuf>,
}

impl JobSource {
    /// Creates a recursive source accepting png, jpg and jpeg.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
            extensions: vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()],
            excluded: Vec::new(),
        }
    }

    /// Sets whether nested directories are scanned.
    #[must_use]
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Replaces the extension allow-list (lowercase, without dots).
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Skips a directory and everything below it.
    #[must_use]
    pub fn exclude(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    /// The scanned root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Finds every supported image, keyed by identity.
    ///
    /// Generated outputs sharing an identity are left behind by re-runs;
    /// the most recent one wins. Any other clash, such as `dog.png` next to
    /// `dog.jpg`, is a [`PreconditionError::DuplicateIdentity`].
    pub fn discover(&self, stage: u32) -> Result<BTreeMap<JobId, SourceFile>, PreconditionError> {
        if !self.root.is_dir() {
            return Err(PreconditionError::MissingInputRoot {
                stage,
                path: self.root.clone(),
            });
        }

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.excluded.iter().any(|dir| entry.path() == dir));

        let mut files: BTreeMap<JobId, SourceFile> = BTreeMap::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(stage, error = %err, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_supported(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(id) = JobId::from_relative_path(relative) else {
                debug!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
                continue;
            };

            let candidate = SourceFile {
                path: entry.path().to_path_buf(),
                relative_path: relative.to_path_buf(),
            };
            match files.get(&id) {
                None => {
                    files.insert(id, candidate);
                }
                Some(current) if !candidate.is_generated() || !current.is_generated() => {
                    return Err(PreconditionError::DuplicateIdentity {
                        stage,
                        first: current.path.clone(),
                        second: candidate.path,
                        job: id,
                    });
                }
                Some(current) if candidate.generation() > current.generation() => {
                    debug!(stage, job = %id, superseded = %current.path.display(), "Superseded older output");
                    files.insert(id, candidate);
                }
                Some(_) => {
                    debug!(stage, job = %id, superseded = %candidate.path.display(), "Superseded older output");
                }
            }
        }

        debug!(stage, root = %self.root.display(), count = files.len(), "Scanned input root");
        Ok(files)
    }

    /// Returns the ordered job sequence for `stage`.
    pub fn scan(&self, stage: u32) -> Result<Vec<JobDescriptor>, PreconditionError> {
        Ok(index_jobs(stage, self.discover(stage)?))
    }

    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
    }
}
