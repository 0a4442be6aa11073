//! Error types for evochain runs.
//!
//! The taxonomy separates what a run can recover from (remote failures,
//! which are demoted to per-job failures) from what it cannot (precondition
//! and configuration errors, which stop the run before any worker starts).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::jobs::JobId;

/// The remote operation a [`RemoteError`] was raised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    /// Image analysis (image in, description out).
    Analyze,
    /// Image synthesis (prompt in, image bytes out).
    Synthesize,
}

impl fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analyze => write!(f, "analyze"),
            Self::Synthesize => write!(f, "synthesize"),
        }
    }
}

/// Failure reported by the remote generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Rate limiting, timeouts and transient network failures. Retried.
    #[error("transient {operation} failure: {message}")]
    Transient {
        /// The failing operation.
        operation: RemoteOperation,
        /// Provider or transport message.
        message: String,
    },

    /// Invalid credentials, invalid input or malformed responses. Never retried.
    #[error("permanent {operation} failure: {message}")]
    Permanent {
        /// The failing operation.
        operation: RemoteOperation,
        /// Provider or transport message.
        message: String,
    },
}

impl RemoteError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(operation: RemoteOperation, message: impl Into<String>) -> Self {
        Self::Transient {
            operation,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(operation: RemoteOperation, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation,
            message: message.into(),
        }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the operation that failed.
    #[must_use]
    pub fn operation(&self) -> RemoteOperation {
        match self {
            Self::Transient { operation, .. } | Self::Permanent { operation, .. } => *operation,
        }
    }

    /// Returns the provider or transport message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message, .. } => message,
        }
    }
}

/// A condition that must hold before a stage may start.
///
/// These are fatal to the run and are raised before any worker of the
/// affected stage is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    /// The input directory for a stage does not exist.
    #[error("input directory for stage {stage} does not exist: {}", path.display())]
    MissingInputRoot {
        /// Stage ordinal that needed the directory.
        stage: u32,
        /// The missing directory.
        path: PathBuf,
    },

    /// The input directory exists but holds no supported images.
    #[error("no supported images found for stage {stage} in {}", path.display())]
    EmptyJobSet {
        /// Stage ordinal.
        stage: u32,
        /// The scanned directory.
        path: PathBuf,
    },

    /// Two input images map to the same job identity, for example
    /// `dog.png` and `dog.jpg` side by side.
    #[error("stage {stage}: {} and {} share the job identity {job}", first.display(), second.display())]
    DuplicateIdentity {
        /// Stage ordinal.
        stage: u32,
        /// The shared identity.
        job: JobId,
        /// File found first.
        first: PathBuf,
        /// File that collided with it.
        second: PathBuf,
    },

    /// The configured stage range is not runnable.
    #[error("invalid stage range {start}..={end}")]
    InvalidStageRange {
        /// Configured start stage.
        start: u32,
        /// Configured end stage.
        end: u32,
    },

    /// The pool was asked to run without workers.
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        /// Field name as it appears in the configuration file.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The credential environment variable is unset or empty.
    #[error("environment variable {0} is not set")]
    MissingCredential(String),

    /// The configuration file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parse failure.
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse failure.
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    #[must_use]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Both the default and the proxy-disabled client constructions failed.
#[derive(Debug, Clone, Error)]
#[error("failed to build remote client (default: {default_error}; without proxy: {fallback_error})")]
pub struct ClientBuildError {
    /// Error from the default construction.
    pub default_error: String,
    /// Error from the proxy-disabled construction.
    pub fallback_error: String,
}

/// The main error type for evochain runs.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A stage precondition failed.
    #[error("{0}")]
    Precondition(#[from] PreconditionError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The remote client could not be constructed.
    #[error("{0}")]
    ClientBuild(#[from] ClientBuildError),

    /// A second result was recorded for the same job in the same stage.
    #[error("duplicate result for job {job} in stage {stage}")]
    DuplicateResult {
        /// Stage ordinal.
        stage: u32,
        /// Job identity.
        job: JobId,
    },

    /// `advance` was called on a run that already finished.
    #[error("the chain has already finished")]
    ChainFinished,

    /// Tracing could not be initialised.
    #[error("failed to initialise tracing: {0}")]
    Tracing(String),

    /// IO error outside of a job workflow.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Returns true for errors that should be reported as a failed precondition.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}
