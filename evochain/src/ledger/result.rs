//! Per-job results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RemoteError;
use crate::jobs::{JobDescriptor, JobId};

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// An output file was written.
    Succeeded,
    /// No output was produced; see the failure detail.
    Failed,
    /// An output already existed and was reused.
    Skipped,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Step of the per-job workflow a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Reading the source file.
    Read,
    /// The analysis call.
    Analyze,
    /// The synthesis call.
    Synthesize,
    /// Writing the output file.
    Persist,
    /// The worker running the job ended abnormally.
    Worker,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Analyze => "analyze",
            Self::Synthesize => "synthesize",
            Self::Persist => "persist",
            Self::Worker => "worker",
        };
        f.write_str(name)
    }
}

/// Why a job failed and how far it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failing step.
    pub phase: JobPhase,
    /// Whether the underlying error was transient.
    pub retryable: bool,
    /// Error text.
    pub message: String,
    /// True if analysis had already produced a description.
    pub analysis_completed: bool,
    /// Attempts made in the failing step (0 for local steps).
    pub attempts: u32,
}

impl JobFailure {
    /// Failure of a remote call after `attempts` attempts.
    #[must_use]
    pub fn remote(phase: JobPhase, error: &RemoteError, attempts: u32, analysis_completed: bool) -> Self {
        Self {
            phase,
            retryable: error.is_retryable(),
            message: error.message().to_string(),
            analysis_completed,
            attempts,
        }
    }

    /// Failure of a local step.
    #[must_use]
    pub fn local(phase: JobPhase, message: impl Into<String>, analysis_completed: bool) -> Self {
        Self {
            phase,
            retryable: false,
            message: message.into(),
            analysis_completed,
            attempts: 0,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.analysis_completed {
            write!(f, "analysis succeeded; ")?;
        }
        if self.attempts > 0 {
            write!(
                f,
                "{} failed after {} attempt(s): {}",
                self.phase, self.attempts, self.message
            )
        } else {
            write!(f, "{} failed: {}", self.phase, self.message)
        }
    }
}

/// Attempts made per remote operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounts {
    /// Analysis attempts.
    pub analyze: u32,
    /// Synthesis attempts.
    pub synthesize: u32,
}

impl AttemptCounts {
    /// Total remote attempts.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.analyze + self.synthesize
    }
}

/// The terminal record of one job in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Job identity.
    pub job: JobId,
    /// Stage ordinal.
    pub stage: u32,
    /// Index within the stage's job sequence.
    pub index: usize,
    /// Worker slot that ran the job.
    pub worker: usize,
    /// Source file the job consumed.
    pub source: PathBuf,
    /// Terminal state.
    pub outcome: JobOutcome,
    /// Output file, for succeeded and skipped jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Failure detail, for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// Remote attempts made.
    pub attempts: AttemptCounts,
    /// Wall-clock time spent on the job.
    #[serde(with = "duration_millis", rename = "duration_ms")]
    pub duration: Duration,
}

impl JobResult {
    fn base(job: &JobDescriptor, worker: usize, outcome: JobOutcome, duration: Duration) -> Self {
        Self {
            job: job.id.clone(),
            stage: job.stage,
            index: job.index,
            worker,
            source: job.source.clone(),
            outcome,
            output_path: None,
            error: None,
            attempts: AttemptCounts::default(),
            duration,
        }
    }

    /// A job that wrote `output`.
    #[must_use]
    pub fn succeeded(
        job: &JobDescriptor,
        worker: usize,
        output: PathBuf,
        attempts: AttemptCounts,
        duration: Duration,
    ) -> Self {
        Self {
            output_path: Some(output),
            attempts,
            ..Self::base(job, worker, JobOutcome::Succeeded, duration)
        }
    }

    /// A job that produced no output.
    #[must_use]
    pub fn failed(
        job: &JobDescriptor,
        worker: usize,
        failure: JobFailure,
        attempts: AttemptCounts,
        duration: Duration,
    ) -> Self {
        Self {
            error: Some(failure),
            attempts,
            ..Self::base(job, worker, JobOutcome::Failed, duration)
        }
    }

    /// A job whose output already existed.
    #[must_use]
    pub fn skipped(job: &JobDescriptor, worker: usize, existing: PathBuf, duration: Duration) -> Self {
        Self {
            output_path: Some(existing),
            ..Self::base(job, worker, JobOutcome::Skipped, duration)
        }
    }

    /// File that represents this identity after the job, if any.
    #[must_use]
    pub fn produced_output(&self) -> Option<&PathBuf> {
        match self.outcome {
            JobOutcome::Succeeded | JobOutcome::Skipped => self.output_path.as_ref(),
            JobOutcome::Failed => None,
        }
    }

    /// Returns true for failed jobs.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.outcome == JobOutcome::Failed
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
