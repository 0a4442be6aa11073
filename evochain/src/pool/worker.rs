//! Per-job workflow: analyze, render, synthesize, persist.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::client::{GeneratedImage, RemoteGenerationClient, SourceImage};
use crate::config::PromptTemplate;
use crate::jobs::{find_existing, JobDescriptor, OutputNamer};
use crate::ledger::{AttemptCounts, JobFailure, JobPhase, JobResult};
use crate::observability::SpanTimer;

/// Everything a worker needs to know about the stage it runs in.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Stage ordinal (0 for batch runs).
    pub ordinal: u32,
    /// Root that job outputs are mirrored under.
    pub output_dir: PathBuf,
    /// Instruction sent with each image.
    pub analysis_prompt: String,
    /// Template the description is merged into.
    pub template: PromptTemplate,
    /// Output naming.
    pub namer: OutputNamer,
    /// Reuse outputs that already exist.
    pub skip_existing: bool,
}

impl StageContext {
    /// Creates a context with a wall-clock namer and no skipping.
    #[must_use]
    pub fn new(
        ordinal: u32,
        output_dir: impl Into<PathBuf>,
        analysis_prompt: impl Into<String>,
        template: PromptTemplate,
    ) -> Self {
        Self {
            ordinal,
            output_dir: output_dir.into(),
            analysis_prompt: analysis_prompt.into(),
            template,
            namer: OutputNamer::new(),
            skip_existing: false,
        }
    }

    /// Replaces the namer.
    #[must_use]
    pub fn with_namer(mut self, namer: OutputNamer) -> Self {
        self.namer = namer;
        self
    }

    /// Enables or disables skipping.
    #[must_use]
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Directory a job's output goes to.
    #[must_use]
    pub fn job_output_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.output_dir.join(job.id.relative_dir())
    }
}

/// Runs one job to a terminal result. Never fails; every error becomes a
/// failed result.
pub(crate) async fn process_job(
    worker: usize,
    job: &JobDescriptor,
    ctx: &StageContext,
    client: &RemoteGenerationClient,
) -> JobResult {
    let timer = SpanTimer::start(format!("job:{}", job.id));
    let out_dir = ctx.job_output_dir(job);

    if ctx.skip_existing {
        match find_existing(&out_dir, job.id.base()).await {
            Ok(Some(existing)) => {
                info!(stage = ctx.ordinal, worker, job = %job.id, output = %existing.display(), "Output exists, skipping");
                return JobResult::skipped(job, worker, existing, timer.finish());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(stage = ctx.ordinal, worker, job = %job.id, error = %err, "Could not check for existing output");
            }
        }
    }

    let mut attempts = AttemptCounts::default();
    let fail = |failure: JobFailure, attempts: AttemptCounts, timer: SpanTimer| {
        warn!(stage = ctx.ordinal, worker, job = %job.id, cause = %failure, "Job failed");
        JobResult::failed(job, worker, failure, attempts, timer.finish())
    };

    let bytes = match tokio::fs::read(&job.source).await {
        Ok(bytes) => bytes,
        Err(err) => return fail(JobFailure::local(JobPhase::Read, err.to_string(), false), attempts, timer),
    };
    let image = SourceImage::new(&job.source, bytes);

    let analysis = client.analyze(&image, &ctx.analysis_prompt).await;
    attempts.analyze = analysis.attempts;
    let description = match analysis.result {
        Ok(description) => description,
        Err(err) => {
            let failure = JobFailure::remote(JobPhase::Analyze, &err, analysis.attempts, false);
            return fail(failure, attempts, timer);
        }
    };
    debug!(stage = ctx.ordinal, worker, job = %job.id, chars = description.len(), "Analysis complete");

    let prompt = ctx.template.render(&description);
    let synthesis = client.synthesize(&prompt).await;
    attempts.synthesize = synthesis.attempts;
    let generated = match synthesis.result {
        Ok(generated) if generated.bytes.is_empty() => {
            let failure = JobFailure::local(JobPhase::Synthesize, "service returned an empty image", true);
            return fail(failure, attempts, timer);
        }
        Ok(generated) => generated,
        Err(err) => {
            let failure = JobFailure::remote(JobPhase::Synthesize, &err, synthesis.attempts, true);
            return fail(failure, attempts, timer);
        }
    };

    match persist(&ctx.namer, &out_dir, job.id.base(), &generated).await {
        Ok(path) => {
            info!(
                stage = ctx.ordinal,
                worker,
                job = %job.id,
                output = %path.display(),
                attempts = attempts.total(),
                "Job succeeded"
            );
            JobResult::succeeded(job, worker, path, attempts, timer.finish())
        }
        Err(err) => fail(JobFailure::local(JobPhase::Persist, err.to_string(), true), attempts, timer),
    }
}

/// Writes the image under a fresh name, removing the file again if the
/// write fails part way.
async fn persist(
    namer: &OutputNamer,
    dir: &Path,
    base: &str,
    image: &GeneratedImage,
) -> io::Result<PathBuf> {
    let (path, mut file) = namer.reserve(dir, base, &image.extension).await?;

    let written = async {
        file.write_all(&image.bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    if let Err(err) = written {
        drop(file);
        if let Err(cleanup) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %cleanup, "Could not remove partial output");
        }
        return Err(err);
    }
    Ok(path)
}
