//! Run configuration.
//!
//! [`ChainConfig`] enumerates every option the orchestrator understands.
//! It deserialises from TOML or JSON with per-field defaults and can also
//! be assembled in code with the `with_*` builders.

mod template;

pub use template::{PromptTemplate, DESCRIPTION_PLACEHOLDER};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{BackoffStrategy, JitterStrategy, RetryPolicy};
use crate::errors::{ChainError, ConfigError, PreconditionError};

/// What the chain does with identities whose job failed in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Failed identities drop out of later stages. A stage with no output
    /// at all stops the chain.
    #[default]
    Halt,
    /// Failed identities re-enter the next stage with the last file that
    /// successfully represented them.
    CarryForward,
}

/// Configuration for the remote generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API base URL, without a trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the bearer credential.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used for image analysis.
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Token cap for analysis responses.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature for analysis.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model used for image synthesis.
    #[serde(default = "default_image_model")]
    pub image_model: String,
    /// Generated image size, e.g. `1024x1024`.
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Generated image quality.
    #[serde(default = "default_image_quality")]
    pub image_quality: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_image_quality() -> String {
    "standard".to_string()
}

fn default_request_timeout() -> f64 {
    120.0
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            vision_model: default_vision_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            image_model: default_image_model(),
            image_size: default_image_size(),
            image_quality: default_image_quality(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sets the credential variable name.
    #[must_use]
    pub fn with_api_key_env(mut self, name: impl Into<String>) -> Self {
        self.api_key_env = name.into();
        self
    }

    /// Gets the request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_seconds)
    }

    /// Reads the credential from the environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential(self.api_key_env.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("service.base_url", "must not be empty"));
        }
        check_seconds("service.request_timeout_seconds", self.request_timeout_seconds)?;
        if self.request_timeout_seconds == 0.0 {
            return Err(ConfigError::invalid(
                "service.request_timeout_seconds",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for batch and chained runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Directory holding the original images.
    pub source_root: PathBuf,
    /// Root for stage directories. Defaults to `source_root`.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    /// Descend into nested category folders.
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// Accepted file extensions, matched case-insensitively.
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
    /// Number of concurrent workers per stage.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Delay between consecutive worker starts, in seconds.
    #[serde(default = "default_startup_offset")]
    pub startup_offset_seconds: f64,
    /// Retries per remote call after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base wait between attempts, in seconds.
    #[serde(default = "default_retry_wait")]
    pub retry_wait_seconds: f64,
    /// How the wait grows between attempts.
    #[serde(default)]
    pub retry_backoff: BackoffStrategy,
    /// Randomisation applied to the wait.
    #[serde(default)]
    pub retry_jitter: JitterStrategy,
    /// First stage to run. Values above 1 resume an earlier chain.
    #[serde(default = "default_start_stage")]
    pub start_stage: u32,
    /// Last stage to run, inclusive.
    #[serde(default = "default_end_stage")]
    pub end_stage: u32,
    /// Pause after each stage barrier, in seconds.
    #[serde(default = "default_stage_pause")]
    pub stage_pause_seconds: f64,
    /// Instruction sent with every image to the analysis call.
    #[serde(default = "default_analysis_prompt")]
    pub analysis_prompt: String,
    /// Template the description is merged into for synthesis.
    #[serde(default)]
    pub prompt_template: PromptTemplate,
    /// Behaviour for identities whose job failed.
    #[serde(default)]
    pub gap_policy: GapPolicy,
    /// Record jobs that already have an output as skipped.
    #[serde(default)]
    pub skip_existing: bool,
    /// Remote service settings.
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_recursive() -> bool {
    true
}

fn default_supported_formats() -> Vec<String> {
    vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()]
}

fn default_worker_count() -> usize {
    2
}

fn default_startup_offset() -> f64 {
    3.0
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_wait() -> f64 {
    2.0
}

fn default_start_stage() -> u32 {
    1
}

fn default_end_stage() -> u32 {
    10
}

fn default_stage_pause() -> f64 {
    5.0
}

fn default_analysis_prompt() -> String {
    "Analyze this image and describe what you see. Focus on the main object and give a \
     clear, detailed description that would help recreate it. Be specific about colors, \
     shapes and characteristics."
        .to_string()
}

impl ChainConfig {
    /// Creates a configuration with defaults for everything but the source root.
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            output_root: None,
            recursive: default_recursive(),
            supported_formats: default_supported_formats(),
            worker_count: default_worker_count(),
            startup_offset_seconds: default_startup_offset(),
            max_retries: default_max_retries(),
            retry_wait_seconds: default_retry_wait(),
            retry_backoff: BackoffStrategy::default(),
            retry_jitter: JitterStrategy::default(),
            start_stage: default_start_stage(),
            end_stage: default_end_stage(),
            stage_pause_seconds: default_stage_pause(),
            analysis_prompt: default_analysis_prompt(),
            prompt_template: PromptTemplate::default(),
            gap_policy: GapPolicy::default(),
            skip_existing: false,
            service: ServiceConfig::default(),
        }
    }

    /// Loads and validates a configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(ConfigError::from)?
        } else {
            toml::from_str(&raw).map_err(ConfigError::from)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Sets the output root.
    #[must_use]
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the startup stagger in seconds.
    #[must_use]
    pub fn with_startup_offset(mut self, seconds: f64) -> Self {
        self.startup_offset_seconds = seconds;
        self
    }

    /// Sets the retry bound and base wait.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, wait_seconds: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_wait_seconds = wait_seconds;
        self
    }

    /// Sets the inclusive stage range.
    #[must_use]
    pub fn with_stages(mut self, start: u32, end: u32) -> Self {
        self.start_stage = start;
        self.end_stage = end;
        self
    }

    /// Sets the pause between stages in seconds.
    #[must_use]
    pub fn with_stage_pause(mut self, seconds: f64) -> Self {
        self.stage_pause_seconds = seconds;
        self
    }

    /// Sets the synthesis template.
    #[must_use]
    pub fn with_prompt_template(mut self, template: impl Into<PromptTemplate>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Sets the analysis instruction.
    #[must_use]
    pub fn with_analysis_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.analysis_prompt = prompt.into();
        self
    }

    /// Sets the gap policy.
    #[must_use]
    pub fn with_gap_policy(mut self, policy: GapPolicy) -> Self {
        self.gap_policy = policy;
        self
    }

    /// Enables or disables skipping of existing outputs.
    #[must_use]
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Enables or disables recursive scanning.
    #[must_use]
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Sets the service configuration.
    #[must_use]
    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    /// Checks every field for usable values.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.worker_count == 0 {
            return Err(PreconditionError::NoWorkers.into());
        }
        if self.start_stage == 0 || self.start_stage > self.end_stage {
            return Err(PreconditionError::InvalidStageRange {
                start: self.start_stage,
                end: self.end_stage,
            }
            .into());
        }
        check_seconds("startup_offset_seconds", self.startup_offset_seconds)?;
        check_seconds("retry_wait_seconds", self.retry_wait_seconds)?;
        check_seconds("stage_pause_seconds", self.stage_pause_seconds)?;
        if self.supported_formats.iter().all(|f| f.trim().is_empty()) {
            return Err(
                ConfigError::invalid("supported_formats", "at least one format is required").into(),
            );
        }
        if !self.prompt_template.has_placeholder() {
            return Err(ConfigError::invalid(
                "prompt_template",
                format!("must contain the {DESCRIPTION_PLACEHOLDER} placeholder"),
            )
            .into());
        }
        self.service.validate()?;
        Ok(())
    }

    /// Returns the root under which stage directories are created.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        self.output_root.as_deref().unwrap_or(&self.source_root)
    }

    /// Returns the output directory of stage `ordinal`.
    #[must_use]
    pub fn stage_dir(&self, ordinal: u32) -> PathBuf {
        self.output_root().join(ordinal.to_string())
    }

    /// Returns the input directory of stage `ordinal`.
    #[must_use]
    pub fn stage_input_dir(&self, ordinal: u32) -> PathBuf {
        if ordinal <= 1 {
            self.source_root.clone()
        } else {
            self.stage_dir(ordinal - 1)
        }
    }

    /// Normalised extension allow-list (lowercase, no leading dot).
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        self.supported_formats
            .iter()
            .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect()
    }

    /// Gets the startup stagger as a Duration.
    #[must_use]
    pub fn startup_offset(&self) -> Duration {
        seconds(self.startup_offset_seconds)
    }

    /// Gets the pause between stages as a Duration.
    #[must_use]
    pub fn stage_pause(&self) -> Duration {
        seconds(self.stage_pause_seconds)
    }

    /// Builds the per-call retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, seconds(self.retry_wait_seconds))
            .with_backoff(self.retry_backoff)
            .with_jitter(self.retry_jitter)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn check_seconds(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("expected a non-negative number of seconds, got {value}"),
        ))
    }
}
