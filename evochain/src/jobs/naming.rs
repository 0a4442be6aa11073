//! Output file naming.
//!
//! Outputs are named `<base>_generated_<YYYYMMDD_HHMMSS>[_<n>].<ext>`, where
//! `<base>` is the job's base stem. Because the base stem strips earlier
//! generation suffixes, names never grow across stages.

use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs::{self, File, OpenOptions};

/// Marker between the base stem and the timestamp.
pub const GENERATED_MARKER: &str = "_generated_";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Upper bound on `_n` suffixes tried for one timestamp.
const MAX_COLLISIONS: u32 = 10_000;

#[allow(clippy::expect_used)]
static GENERATED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:_generated_\d{8}_\d{6}(?:_\d+)?)+$").expect("generated suffix pattern is valid")
});

#[allow(clippy::expect_used)]
static LATEST_GENERATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_generated_(\d{8}_\d{6})(?:_(\d+))?$").expect("generation key pattern is valid")
});

/// Strips any generation suffixes from a file stem.
///
/// ```
/// use evochain::jobs::base_stem;
/// assert_eq!(base_stem("dog_generated_20250101_120000"), "dog");
/// assert_eq!(base_stem("dog_generated_20250101_120000_2"), "dog");
/// assert_eq!(base_stem("dog"), "dog");
/// ```
#[must_use]
pub fn base_stem(stem: &str) -> &str {
    match GENERATED_SUFFIX.find(stem) {
        // A file literally named `_generated_...` keeps its full stem.
        Some(m) if m.start() > 0 => &stem[..m.start()],
        _ => stem,
    }
}

/// Orders generated outputs by their last timestamp, then by collision counter.
///
/// Returns `None` for stems without a generation suffix.
///
/// ```
/// use evochain::jobs::generation_key;
/// assert!(generation_key("dog_generated_20250101_120000_10") > generation_key("dog_generated_20250101_120000_9"));
/// assert_eq!(generation_key("dog_generated_20250101_120000"), Some(("20250101_120000", 0)));
/// assert_eq!(generation_key("dog"), None);
/// ```
#[must_use]
pub fn generation_key(stem: &str) -> Option<(&str, u32)> {
    let caps = LATEST_GENERATION.captures(stem)?;
    let timestamp = caps.get(1)?.as_str();
    let collision = match caps.get(2) {
        Some(n) => n.as_str().parse().ok()?,
        None => 0,
    };
    Some((timestamp, collision))
}

/// Returns true if `stem` names a generated output rather than an original.
#[must_use]
pub fn is_generated(stem: &str) -> bool {
    base_stem(stem).len() < stem.len()
}

#[derive(Debug, Clone)]
enum Clock {
    Local,
    Fixed(String),
}

/// Produces collision-free output paths.
#[derive(Debug, Clone)]
pub struct OutputNamer {
    clock: Clock,
}

impl Default for OutputNamer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputNamer {
    /// Creates a namer stamping names with the local wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self { clock: Clock::Local }
    }

    /// Creates a namer that always uses `timestamp`.
    #[must_use]
    pub fn fixed(timestamp: impl Into<String>) -> Self {
        Self {
            clock: Clock::Fixed(timestamp.into()),
        }
    }

    /// Returns the timestamp the next name would carry.
    #[must_use]
    pub fn timestamp(&self) -> String {
        match &self.clock {
            Clock::Local => chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            Clock::Fixed(ts) => ts.clone(),
        }
    }

    /// Formats a file name. `collision` 0 means no `_n` suffix.
    #[must_use]
    pub fn file_name(base: &str, timestamp: &str, collision: u32, extension: &str) -> String {
        if collision == 0 {
            format!("{base}{GENERATED_MARKER}{timestamp}.{extension}")
        } else {
            format!("{base}{GENERATED_MARKER}{timestamp}_{collision}.{extension}")
        }
    }

    /// Creates a new, empty output file for `base` inside `dir`.
    ///
    /// Parent directories are created as needed. Existing files are never
    /// opened; on a name clash the next `_n` suffix is tried.
    pub async fn reserve(
        &self,
        dir: &Path,
        base: &str,
        extension: &str,
    ) -> io::Result<(PathBuf, File)> {
        fs::create_dir_all(dir).await?;
        let timestamp = self.timestamp();

        for collision in 0..MAX_COLLISIONS {
            let path = dir.join(Self::file_name(base, &timestamp, collision, extension));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free output name for {base} in {}", dir.display()),
        ))
    }
}

/// Finds the most recent generated output for `base` in `dir`.
///
/// Returns `None` when the directory is missing or holds no match.
pub async fn find_existing(dir: &Path, base: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let prefix = format!("{base}{GENERATED_MARKER}");
    let mut best: Option<((String, u32), PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let stem = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !name.starts_with(&prefix) || base_stem(&stem) != base {
            continue;
        }
        let Some((timestamp, collision)) = generation_key(&stem) else {
            continue;
        };
        let key = (timestamp.to_string(), collision);
        if best.as_ref().map_or(true, |(current, _)| key > *current) {
            best = Some((key, entry.path()));
        }
    }

    Ok(best.map(|(_, path)| path))
}
