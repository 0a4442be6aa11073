//! Remote generation client.
//!
//! [`GenerationService`] is the transport seam: one implementation talks
//! HTTP, tests use scripted or mocked ones. [`RemoteGenerationClient`]
//! wraps any service with the per-call retry policy and reports how many
//! attempts each call took.

#[cfg(feature = "http")]
mod http;
mod retry;

#[cfg(feature = "http")]
pub use http::{classify_status, with_proxy_fallback, HttpGenerationClient, ProxyMode};
pub use retry::{BackoffStrategy, CallOutcome, JitterStrategy, RetryPolicy};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::RemoteError;

/// An image loaded for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Where the bytes were read from.
    pub path: PathBuf,
    /// Raw file contents.
    pub bytes: Vec<u8>,
    /// MIME type guessed from the extension.
    pub mime: &'static str,
}

impl SourceImage {
    /// Wraps bytes read from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        let path = path.into();
        let mime = mime_for(&path);
        Self { path, bytes, mime }
    }

    /// File name for log output.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

/// Image bytes returned by synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Encoded image.
    pub bytes: Vec<u8>,
    /// File extension for the encoding, without a dot.
    pub extension: String,
}

impl GeneratedImage {
    /// Creates a PNG result.
    #[must_use]
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "png".to_string(),
        }
    }
}

/// The two operations the remote service offers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Describes an image following `instruction`.
    async fn analyze(&self, image: &SourceImage, instruction: &str) -> Result<String, RemoteError>;

    /// Generates an image from a prompt.
    async fn synthesize(&self, prompt: &str) -> Result<GeneratedImage, RemoteError>;
}

/// A [`GenerationService`] with bounded retry around each call.
///
/// Holds no per-call state, so one instance is shared by every worker.
#[derive(Clone)]
pub struct RemoteGenerationClient {
    service: Arc<dyn GenerationService>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RemoteGenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGenerationClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RemoteGenerationClient {
    /// Wraps a service.
    #[must_use]
    pub fn new(service: Arc<dyn GenerationService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    /// The retry policy applied to each call.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Analyzes an image, retrying transient failures.
    pub async fn analyze(&self, image: &SourceImage, instruction: &str) -> CallOutcome<String> {
        self.retry
            .run("analyze", || self.service.analyze(image, instruction))
            .await
    }

    /// Synthesizes an image, retrying transient failures.
    pub async fn synthesize(&self, prompt: &str) -> CallOutcome<GeneratedImage> {
        self.retry
            .run("synthesize", || self.service.synthesize(prompt))
            .await
    }
}
