//! A deterministic, scriptable generation service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::client::{GeneratedImage, GenerationService, SourceImage};
use crate::errors::{RemoteError, RemoteOperation};

type PathPredicate = Box<dyn Fn(&Path) -> bool + Send + Sync>;
type PromptPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    /// Which operation was called.
    pub operation: RemoteOperation,
    /// Image path for analysis, prompt for synthesis.
    pub subject: String,
    /// When the call arrived.
    pub at: Instant,
}

/// A [`GenerationService`] driven by scripts.
///
/// Without a script, analysis answers `description of <stem>` and
/// synthesis returns the prompt bytes as a PNG, so written outputs show
/// exactly which prompt produced them.
#[derive(Default)]
pub struct ScriptedService {
    analyze_scripts: Mutex<Vec<(String, VecDeque<Result<String, RemoteError>>)>>,
    synthesize_scripts: Mutex<Vec<(String, VecDeque<Result<GeneratedImage, RemoteError>>)>>,
    analyze_failures: Vec<PathPredicate>,
    synthesize_failures: Vec<PromptPredicate>,
    latency: Duration,
    calls: Mutex<Vec<ServiceCall>>,
}

impl std::fmt::Debug for ScriptedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedService")
            .field("latency", &self.latency)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedService {
    /// Creates a service that succeeds on everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues analysis results for images whose file name contains `key`.
    #[must_use]
    pub fn with_analyze_script(
        self,
        key: impl Into<String>,
        results: Vec<Result<String, RemoteError>>,
    ) -> Self {
        self.analyze_scripts.lock().push((key.into(), results.into()));
        self
    }

    /// Queues synthesis results for prompts containing `key`.
    #[must_use]
    pub fn with_synthesize_script(
        self,
        key: impl Into<String>,
        results: Vec<Result<GeneratedImage, RemoteError>>,
    ) -> Self {
        self.synthesize_scripts.lock().push((key.into(), results.into()));
        self
    }

    /// Fails analysis permanently for every path matching `predicate`.
    #[must_use]
    pub fn fail_analyze_when(mut self, predicate: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.analyze_failures.push(Box::new(predicate));
        self
    }

    /// Fails synthesis permanently for every prompt matching `predicate`.
    #[must_use]
    pub fn fail_synthesize_when(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.synthesize_failures.push(Box::new(predicate));
        self
    }

    /// Every call so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    /// Calls of one operation.
    #[must_use]
    pub fn calls_of(&self, operation: RemoteOperation) -> Vec<ServiceCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Paths passed to analysis, in arrival order.
    #[must_use]
    pub fn analyzed_paths(&self) -> Vec<PathBuf> {
        self.calls_of(RemoteOperation::Analyze)
            .into_iter()
            .map(|c| PathBuf::from(c.subject))
            .collect()
    }

    fn record(&self, operation: RemoteOperation, subject: String) {
        self.calls.lock().push(ServiceCall {
            operation,
            subject,
            at: Instant::now(),
        });
    }

    fn next_scripted<T>(scripts: &Mutex<Vec<(String, VecDeque<T>)>>, subject: &str) -> Option<T> {
        scripts
            .lock()
            .iter_mut()
            .find(|(key, queue)| subject.contains(key.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
    }
}

#[async_trait]
impl GenerationService for ScriptedService {
    async fn analyze(&self, image: &SourceImage, _instruction: &str) -> Result<String, RemoteError> {
        self.record(RemoteOperation::Analyze, image.path.display().to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(result) = Self::next_scripted(&self.analyze_scripts, &image.file_name()) {
            return result;
        }
        if self.analyze_failures.iter().any(|p| p(&image.path)) {
            return Err(RemoteError::permanent(RemoteOperation::Analyze, "scripted permanent failure"));
        }

        let stem = image
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("description of {}", crate::jobs::base_stem(&stem)))
    }

    async fn synthesize(&self, prompt: &str) -> Result<GeneratedImage, RemoteError> {
        self.record(RemoteOperation::Synthesize, prompt.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(result) = Self::next_scripted(&self.synthesize_scripts, prompt) {
            return result;
        }
        if self.synthesize_failures.iter().any(|p| p(prompt)) {
            return Err(RemoteError::permanent(RemoteOperation::Synthesize, "scripted permanent failure"));
        }
        Ok(GeneratedImage::png(prompt.as_bytes().to_vec()))
    }
}
