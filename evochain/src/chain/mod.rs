//! Stage orchestration.
//!
//! A chain runs stages `start..=end` and stage `k` writes
//! `<output_root>/<k>/`. The entry stage scans its input directory (the
//! source root for stage 1, `<output_root>/<k-1>/` on resume); every later
//! stage consumes exactly the files the previous stage produced in this run.
//! Each stage is one pool run; the next stage starts only after the pool
//! has returned a result for every job.

mod report;
mod state;

#[cfg(test)]
mod integration_tests;

pub use report::{ChainReport, StageReport};
pub use state::{RunState, StagePhase};

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::RemoteGenerationClient;
use crate::config::{ChainConfig, GapPolicy};
use crate::errors::{ChainError, PreconditionError};
use crate::events::{names, EventSink};
use crate::jobs::{index_jobs, JobId, JobSource, OutputNamer, SourceFile};
use crate::ledger::{LedgerSummary, ResultLedger};
use crate::observability::SpanTimer;
use crate::pool::{stagger_schedule, StageContext, WorkerPool};

/// Drives batch and chained runs.
pub struct StageOrchestrator {
    config: Arc<ChainConfig>,
    client: Arc<RemoteGenerationClient>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StageOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        config: ChainConfig,
        client: Arc<RemoteGenerationClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            events,
        }
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Output directory of stage `ordinal`.
    #[must_use]
    pub fn stage_dir(&self, ordinal: u32) -> PathBuf {
        self.config.stage_dir(ordinal)
    }

    /// Validates the configuration and the resume point.
    ///
    /// Resuming at stage `k > 1` requires stage `k-1`'s directory to exist;
    /// starting at stage 1 requires the source root.
    pub fn initial_state(&self) -> Result<RunState, ChainError> {
        self.config.validate()?;

        let start = self.config.start_stage;
        let input = self.config.stage_input_dir(start);
        if !input.is_dir() {
            return Err(PreconditionError::MissingInputRoot {
                stage: start,
                path: input,
            }
            .into());
        }

        let state = RunState::new(
            start,
            self.config.end_stage,
            self.config.worker_count,
            stagger_schedule(self.config.worker_count, self.config.startup_offset()),
        );
        info!(
            run_id = %state.run_id(),
            start_stage = start,
            end_stage = self.config.end_stage,
            workers = self.config.worker_count,
            "Chain initialised"
        );
        Ok(state)
    }

    /// Executes exactly one stage.
    ///
    /// From `Complete(k)` the state first moves to `Pending(k+1)` after the
    /// inter-stage pause. Results are recorded into `ledger`.
    pub async fn advance(
        &self,
        mut state: RunState,
        ledger: &mut ResultLedger,
    ) -> Result<(RunState, StageReport), ChainError> {
        if state.is_finished() {
            return Err(ChainError::ChainFinished);
        }
        if state.phase() == StagePhase::Complete {
            let pause = self.config.stage_pause();
            if !pause.is_zero() {
                info!(seconds = pause.as_secs_f64(), "Pausing before next stage");
                tokio::time::sleep(pause).await;
            }
            state.next_stage();
        }

        let ordinal = state.stage();
        let timer = SpanTimer::start(format!("stage:{ordinal}"));
        let input_dir = self.config.stage_input_dir(ordinal);
        let output_dir = self.stage_dir(ordinal);

        // Only the entry stage scans a directory. Later stages take what the
        // previous stage produced in this run, never older files left beside it.
        let mut files: BTreeMap<JobId, SourceFile> = match state.stage_outputs() {
            Some(outputs) => outputs
                .iter()
                .map(|(id, path)| (id.clone(), SourceFile::for_job(id, path)))
                .collect(),
            None => self.source_for(ordinal, &input_dir).discover(ordinal)?,
        };
        let mut carried_forward = 0;
        if self.config.gap_policy == GapPolicy::CarryForward {
            for (id, path) in state.lineage() {
                if files.contains_key(id) {
                    continue;
                }
                info!(stage = ordinal, job = %id, source = %path.display(), "Carrying forward last good file");
                files.insert(id.clone(), SourceFile::for_job(id, path));
                carried_forward += 1;
            }
        }
        if files.is_empty() {
            return Err(PreconditionError::EmptyJobSet {
                stage: ordinal,
                path: input_dir,
            }
            .into());
        }

        let jobs = index_jobs(ordinal, files);
        tokio::fs::create_dir_all(&output_dir).await?;
        state.begin();
        info!(
            stage = ordinal,
            input = %input_dir.display(),
            output = %output_dir.display(),
            jobs = jobs.len(),
            carried_forward,
            "Stage started"
        );
        self.events
            .emit(
                names::STAGE_STARTED,
                Some(json!({
                    "run_id": state.run_id(),
                    "stage": ordinal,
                    "jobs": jobs.len(),
                    "input_dir": input_dir,
                    "output_dir": output_dir,
                })),
            )
            .await;

        let ctx = StageContext::new(
            ordinal,
            &output_dir,
            self.config.analysis_prompt.clone(),
            self.config.prompt_template.clone(),
        )
        .with_namer(OutputNamer::new())
        .with_skip_existing(self.config.skip_existing);
        let results = self.pool()?.run(Arc::new(ctx), jobs).await;

        let mut outputs = BTreeMap::new();
        for result in &results {
            match result.produced_output() {
                Some(output) => {
                    state.remember(result.job.clone(), output.clone());
                    outputs.insert(result.job.clone(), output.clone());
                }
                None => state.remember(result.job.clone(), result.source.clone()),
            }
        }
        state.record_outputs(outputs);
        let summary: LedgerSummary = results.iter().collect();
        ledger.record_all(results)?;
        state.complete();

        let report = StageReport::from_summary(
            ordinal,
            input_dir,
            output_dir,
            summary,
            carried_forward,
            timer.finish(),
        );
        info!(
            stage = ordinal,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "Stage completed"
        );
        self.events
            .emit(names::STAGE_COMPLETED, Some(json!({ "run_id": state.run_id(), "report": report })))
            .await;

        if report.produced() == 0 && ordinal < state.end_stage() && self.config.gap_policy == GapPolicy::Halt {
            warn!(stage = ordinal, "Stage produced no outputs, halting chain");
            state.halt();
            self.events
                .emit(names::CHAIN_HALTED, Some(json!({ "run_id": state.run_id(), "stage": ordinal })))
                .await;
        }

        Ok((state, report))
    }

    /// Runs every remaining stage and returns the aggregate report.
    pub async fn run(&self) -> Result<ChainReport, ChainError> {
        let timer = SpanTimer::start("chain");
        let mut state = self.initial_state()?;
        let mut ledger = ResultLedger::new();
        let mut stages = Vec::new();

        self.events
            .emit(
                names::CHAIN_STARTED,
                Some(json!({
                    "run_id": state.run_id(),
                    "start_stage": state.start_stage(),
                    "end_stage": state.end_stage(),
                    "workers": state.worker_count(),
                })),
            )
            .await;

        while !state.is_finished() {
            let (next, report) = self.advance(state, &mut ledger).await?;
            stages.push(report);
            state = next;
        }

        let report = ChainReport {
            run_id: state.run_id(),
            stages,
            ledger,
            halted_after: state.halted_after(),
            duration: timer.finish(),
        };
        self.finish(&report).await;
        Ok(report)
    }

    /// Runs one pool pass from `input_root` into `output_root`, mirroring
    /// nesting without a stage subdirectory.
    pub async fn run_batch(
        &self,
        input_root: impl AsRef<Path>,
        output_root: impl AsRef<Path>,
    ) -> Result<ChainReport, ChainError> {
        let timer = SpanTimer::start("batch");
        let input_root = input_root.as_ref().to_path_buf();
        let output_root = output_root.as_ref().to_path_buf();
        if self.config.worker_count == 0 {
            return Err(PreconditionError::NoWorkers.into());
        }

        let jobs = JobSource::new(&input_root)
            .with_recursive(self.config.recursive)
            .with_extensions(self.config.extensions())
            .exclude(&output_root)
            .scan(0)?;
        if jobs.is_empty() {
            return Err(PreconditionError::EmptyJobSet {
                stage: 0,
                path: input_root,
            }
            .into());
        }

        tokio::fs::create_dir_all(&output_root).await?;
        let state = RunState::new(0, 0, self.config.worker_count, Vec::new());
        self.events
            .emit(
                names::STAGE_STARTED,
                Some(json!({ "run_id": state.run_id(), "stage": 0, "jobs": jobs.len() })),
            )
            .await;

        let ctx = StageContext::new(
            0,
            &output_root,
            self.config.analysis_prompt.clone(),
            self.config.prompt_template.clone(),
        )
        .with_skip_existing(self.config.skip_existing);
        let results = self.pool()?.run(Arc::new(ctx), jobs).await;

        let summary: LedgerSummary = results.iter().collect();
        let mut ledger = ResultLedger::new();
        ledger.record_all(results)?;

        let stage = StageReport::from_summary(0, input_root, output_root, summary, 0, timer.elapsed());
        self.events
            .emit(names::STAGE_COMPLETED, Some(json!({ "run_id": state.run_id(), "report": stage })))
            .await;

        let report = ChainReport {
            run_id: state.run_id(),
            stages: vec![stage],
            ledger,
            halted_after: None,
            duration: timer.finish(),
        };
        self.finish(&report).await;
        Ok(report)
    }

    fn pool(&self) -> Result<WorkerPool, PreconditionError> {
        WorkerPool::new(
            self.config.worker_count,
            self.config.startup_offset(),
            Arc::clone(&self.client),
            Arc::clone(&self.events),
        )
    }

    fn source_for(&self, ordinal: u32, input_dir: &Path) -> JobSource {
        let mut source = JobSource::new(input_dir)
            .with_recursive(self.config.recursive)
            .with_extensions(self.config.extensions());
        if ordinal <= 1 {
            for dir in self.stage_dirs_to_exclude() {
                source = source.exclude(dir);
            }
        }
        source
    }

    /// Stage directories `1..=end_stage` plus any numbered directory an
    /// earlier, longer run left in the output root.
    fn stage_dirs_to_exclude(&self) -> BTreeSet<PathBuf> {
        let mut dirs: BTreeSet<PathBuf> = (1..=self.config.end_stage).map(|k| self.stage_dir(k)).collect();
        if let Ok(entries) = std::fs::read_dir(self.config.output_root()) {
            for entry in entries.flatten() {
                let numbered = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.parse::<u32>().is_ok_and(|k| k > 0));
                if numbered && entry.path().is_dir() {
                    dirs.insert(entry.path());
                }
            }
        }
        dirs
    }

    async fn finish(&self, report: &ChainReport) {
        let summary = report.summary();
        info!(
            run_id = %report.run_id,
            stages = report.stages.len(),
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            halted_after = ?report.halted_after,
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Run finished"
        );
        for failure in report.ledger.failures() {
            if let Some(error) = &failure.error {
                warn!(stage = failure.stage, job = %failure.job, cause = %error, "Failed job");
            }
        }
        self.events
            .emit(
                names::CHAIN_COMPLETED,
                Some(json!({
                    "run_id": report.run_id,
                    "summary": summary,
                    "halted_after": report.halted_after,
                })),
            )
            .await;
    }
}
