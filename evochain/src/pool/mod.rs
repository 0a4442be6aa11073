//! Fixed-size worker pool.
//!
//! Job `i` runs on worker `i mod N`; each worker walks its jobs in
//! ascending index order and sends every terminal result over a channel.
//! The pool collects until all senders are gone, joins the workers and
//! returns one result per job sorted by index.

mod worker;

pub use worker::StageContext;

use futures::future::join_all;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::RemoteGenerationClient;
use crate::errors::PreconditionError;
use crate::events::{names, EventSink};
use crate::jobs::JobDescriptor;
use crate::ledger::{AttemptCounts, JobFailure, JobPhase, JobResult};

/// Splits jobs into per-worker sequences: worker `w` gets jobs `w, w+N, ...`.
#[must_use]
pub fn partition_jobs(jobs: &[JobDescriptor], worker_count: usize) -> Vec<Vec<JobDescriptor>> {
    let worker_count = worker_count.max(1);
    let mut assignments = vec![Vec::new(); worker_count];
    let mut ordered: Vec<&JobDescriptor> = jobs.iter().collect();
    ordered.sort_by_key(|job| job.index);
    for job in ordered {
        assignments[job.worker_for(worker_count)].push(job.clone());
    }
    assignments
}

/// Runs one stage's jobs on a fixed number of workers.
pub struct WorkerPool {
    worker_count: usize,
    startup_offset: Duration,
    client: Arc<RemoteGenerationClient>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("startup_offset", &self.startup_offset)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool. Zero workers is rejected.
    pub fn new(
        worker_count: usize,
        startup_offset: Duration,
        client: Arc<RemoteGenerationClient>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, PreconditionError> {
        if worker_count == 0 {
            return Err(PreconditionError::NoWorkers);
        }
        Ok(Self {
            worker_count,
            startup_offset,
            client,
            events,
        })
    }

    /// Number of worker slots.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Start delay of each worker slot.
    #[must_use]
    pub fn stagger_schedule(&self) -> Vec<Duration> {
        stagger_schedule(self.worker_count, self.startup_offset)
    }

    /// Runs every job and returns exactly one result per job, sorted by index.
    pub async fn run(&self, ctx: Arc<StageContext>, jobs: Vec<JobDescriptor>) -> Vec<JobResult> {
        let expected = jobs.len();
        let stage = ctx.ordinal;
        let schedule = self.stagger_schedule();
        let (tx, mut rx) = mpsc::unbounded_channel::<JobResult>();

        info!(stage, jobs = expected, workers = self.worker_count, "Starting worker pool");

        let mut handles = Vec::with_capacity(self.worker_count);
        for (worker, assigned) in partition_jobs(&jobs, self.worker_count).into_iter().enumerate() {
            if assigned.is_empty() {
                debug!(stage, worker, "No jobs assigned, worker not started");
                continue;
            }
            let task = run_worker(
                worker,
                schedule[worker],
                assigned.clone(),
                Arc::clone(&ctx),
                Arc::clone(&self.client),
                Arc::clone(&self.events),
                tx.clone(),
            );
            handles.push((worker, assigned, tokio::spawn(task)));
        }
        drop(tx);

        let mut results = Vec::with_capacity(expected);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let joined = join_all(
            handles
                .into_iter()
                .map(|(worker, assigned, handle)| async move { (worker, assigned, handle.await) }),
        )
        .await;

        for (worker, assigned, outcome) in joined {
            let Err(join_error) = outcome else { continue };
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic())
            } else {
                "worker task was cancelled".to_string()
            };
            error!(stage, worker, error = %message, "Worker ended abnormally");

            for job in assigned {
                if results.iter().any(|r| r.index == job.index) {
                    continue;
                }
                let failure = JobFailure::local(JobPhase::Worker, message.clone(), false);
                warn!(stage, worker, job = %job.id, "Job lost with its worker");
                results.push(JobResult::failed(&job, worker, failure, AttemptCounts::default(), Duration::ZERO));
            }
        }

        results.sort_by_key(|r| r.index);
        results
    }
}

/// `[0, offset, 2*offset, ...]` for `worker_count` workers.
#[must_use]
pub fn stagger_schedule(worker_count: usize, offset: Duration) -> Vec<Duration> {
    (0..worker_count)
        .map(|w| offset.saturating_mul(u32::try_from(w).unwrap_or(u32::MAX)))
        .collect()
}

async fn run_worker(
    worker: usize,
    delay: Duration,
    jobs: Vec<JobDescriptor>,
    ctx: Arc<StageContext>,
    client: Arc<RemoteGenerationClient>,
    events: Arc<dyn EventSink>,
    tx: mpsc::UnboundedSender<JobResult>,
) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let stage = ctx.ordinal;
    debug!(stage, worker, jobs = jobs.len(), "Worker started");
    events.try_emit(
        names::WORKER_STARTED,
        Some(json!({ "stage": stage, "worker": worker, "jobs": jobs.len() })),
    );

    for job in &jobs {
        events.try_emit(
            names::JOB_STARTED,
            Some(json!({ "stage": stage, "worker": worker, "job": job.id.to_string(), "index": job.index })),
        );

        let result = worker::process_job(worker, job, &ctx, &client).await;

        events.try_emit(
            names::JOB_COMPLETED,
            Some(json!({
                "stage": stage,
                "worker": worker,
                "job": job.id.to_string(),
                "index": job.index,
                "outcome": result.outcome,
            })),
        );
        if tx.send(result).is_err() {
            warn!(stage, worker, "Result channel closed, stopping worker");
            break;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GeneratedImage, GenerationService, RetryPolicy, SourceImage};
    use crate::config::PromptTemplate;
    use crate::errors::RemoteError;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::jobs::{JobId, JobSource, OutputNamer};
    use crate::ledger::JobOutcome;
    use crate::testing::{ImageTree, ScriptedService};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};

    fn jobs(count: usize) -> Vec<JobDescriptor> {
        (0..count)
            .map(|index| JobDescriptor {
                index,
                id: JobId::new("", format!("img{index}")),
                source: PathBuf::from(format!("img{index}.png")),
                relative_path: PathBuf::from(format!("img{index}.png")),
                stage: 1,
            })
            .collect()
    }

    fn context(out: &Path) -> Arc<StageContext> {
        Arc::new(
            StageContext::new(1, out, "describe", PromptTemplate::text("[DESCRIPTION]"))
                .with_namer(OutputNamer::fixed("20250101_120000")),
        )
    }

    fn pool(service: Arc<dyn GenerationService>, workers: usize, offset: Duration) -> WorkerPool {
        let client = Arc::new(RemoteGenerationClient::new(service, RetryPolicy::no_retry()));
        WorkerPool::new(workers, offset, client, Arc::new(NoOpEventSink)).unwrap()
    }

    #[test]
    fn test_partition_covers_every_job_once() {
        for m in 0..12 {
            for n in 1..5 {
                let parts = partition_jobs(&jobs(m), n);
                assert_eq!(parts.len(), n);
                let mut seen: Vec<usize> = parts.iter().flatten().map(|j| j.index).collect();
                seen.sort_unstable();
                assert_eq!(seen, (0..m).collect::<Vec<_>>());
                for (w, part) in parts.iter().enumerate() {
                    assert!(part.iter().all(|j| j.index % n == w));
                    assert!(part.windows(2).all(|pair| pair[0].index < pair[1].index));
                }
            }
        }
    }

    #[test]
    fn test_stagger_schedule() {
        assert_eq!(
            stagger_schedule(3, Duration::from_secs(3)),
            vec![Duration::ZERO, Duration::from_secs(3), Duration::from_secs(6)]
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let client = Arc::new(RemoteGenerationClient::new(
            Arc::new(ScriptedService::new()),
            RetryPolicy::no_retry(),
        ));
        let err = WorkerPool::new(0, Duration::ZERO, client, Arc::new(NoOpEventSink)).unwrap_err();
        assert_eq!(err, PreconditionError::NoWorkers);
    }

    #[tokio::test]
    async fn test_results_sorted_and_attributed() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        ImageTree::create(input.path(), &["a.png", "b.png", "c.png", "d.png", "e.png"]).unwrap();
        let service = ScriptedService::new().with_latency(Duration::from_millis(5));

        let results = pool(Arc::new(service), 2, Duration::ZERO)
            .run(context(output.path()), JobSource::new(input.path()).scan(1).unwrap())
            .await;

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.worker, i % 2);
            assert_eq!(result.outcome, JobOutcome::Succeeded);
        }
        assert_eq!(ImageTree::files_under(output.path()).len(), 5);
    }

    #[tokio::test]
    async fn test_pool_emits_lifecycle_events() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        ImageTree::create(input.path(), &["a.png", "b.png", "c.png"]).unwrap();

        let events = Arc::new(CollectingEventSink::new());
        let client = Arc::new(RemoteGenerationClient::new(
            Arc::new(ScriptedService::new()),
            RetryPolicy::no_retry(),
        ));
        let pool = WorkerPool::new(4, Duration::ZERO, client, events.clone()).unwrap();
        pool.run(context(output.path()), JobSource::new(input.path()).scan(1).unwrap())
            .await;

        assert_eq!(events.events_of_type(names::WORKER_STARTED).len(), 3);
        assert_eq!(events.events_of_type(names::JOB_STARTED).len(), 3);
        assert_eq!(events.events_of_type(names::JOB_COMPLETED).len(), 3);
    }

    struct PanicOnSecond;

    #[async_trait]
    impl GenerationService for PanicOnSecond {
        async fn analyze(&self, image: &SourceImage, _instruction: &str) -> Result<String, RemoteError> {
            assert!(!image.path.ends_with("img2.png"), "analysis crashed on img2");
            Ok("ok".to_string())
        }

        async fn synthesize(&self, prompt: &str) -> Result<GeneratedImage, RemoteError> {
            Ok(GeneratedImage::png(prompt.as_bytes().to_vec()))
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_jobs_are_marked_failed() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        ImageTree::create(input.path(), &["img0.png", "img1.png", "img2.png", "img3.png", "img4.png"]).unwrap();

        let results = pool(Arc::new(PanicOnSecond), 2, Duration::ZERO)
            .run(context(output.path()), JobSource::new(input.path()).scan(1).unwrap())
            .await;

        assert_eq!(results.len(), 5);
        let outcomes: Vec<JobOutcome> = results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Succeeded,
                JobOutcome::Succeeded,
                JobOutcome::Failed,
                JobOutcome::Succeeded,
                JobOutcome::Failed,
            ]
        );
        let lost = results[4].error.as_ref().unwrap();
        assert_eq!(lost.phase, JobPhase::Worker);
        assert!(lost.message.contains("analysis crashed on img2"));
    }
}
