//! Explicit run state, passed into and returned from each stage advance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::JobId;

/// Where the current stage is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    /// Not started yet.
    Pending,
    /// Its pool is running.
    Running,
    /// Every job reached a terminal result.
    Complete,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// State of one chained run.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    run_id: Uuid,
    stage: u32,
    phase: StagePhase,
    start_stage: u32,
    end_stage: u32,
    worker_count: usize,
    stagger: Vec<Duration>,
    lineage: BTreeMap<JobId, PathBuf>,
    outputs: Option<BTreeMap<JobId, PathBuf>>,
    halted: bool,
    started_at: DateTime<Utc>,
}

impl RunState {
    /// A fresh run in `Pending(start_stage)`.
    #[must_use]
    pub fn new(start_stage: u32, end_stage: u32, worker_count: usize, stagger: Vec<Duration>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage: start_stage,
            phase: StagePhase::Pending,
            start_stage,
            end_stage,
            worker_count,
            stagger,
            lineage: BTreeMap::new(),
            outputs: None,
            halted: false,
            started_at: Utc::now(),
        }
    }

    /// Unique id of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current stage ordinal.
    #[must_use]
    pub fn stage(&self) -> u32 {
        self.stage
    }

    /// Phase of the current stage.
    #[must_use]
    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    /// First stage of the run.
    #[must_use]
    pub fn start_stage(&self) -> u32 {
        self.start_stage
    }

    /// Last stage of the run.
    #[must_use]
    pub fn end_stage(&self) -> u32 {
        self.end_stage
    }

    /// Number of stages this run covers.
    #[must_use]
    pub fn total_stages(&self) -> u32 {
        self.end_stage.saturating_sub(self.start_stage) + 1
    }

    /// Workers per stage.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Start delay per worker slot.
    #[must_use]
    pub fn stagger(&self) -> &[Duration] {
        &self.stagger
    }

    /// Last file that successfully represented each identity.
    #[must_use]
    pub fn lineage(&self) -> &BTreeMap<JobId, PathBuf> {
        &self.lineage
    }

    /// Files produced by the last stage this run completed, by identity.
    ///
    /// `None` until a stage completes, in which case the next stage has to
    /// scan its input directory instead.
    #[must_use]
    pub fn stage_outputs(&self) -> Option<&BTreeMap<JobId, PathBuf>> {
        self.outputs.as_ref()
    }

    /// When the run started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True if the chain stopped before its last stage.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stage after which the chain stopped early.
    #[must_use]
    pub fn halted_after(&self) -> Option<u32> {
        self.halted.then_some(self.stage)
    }

    /// True once no further stage will run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.halted || (self.phase == StagePhase::Complete && self.stage >= self.end_stage)
    }

    pub(crate) fn begin(&mut self) {
        self.phase = StagePhase::Running;
    }

    pub(crate) fn complete(&mut self) {
        self.phase = StagePhase::Complete;
    }

    pub(crate) fn next_stage(&mut self) {
        self.stage += 1;
        self.phase = StagePhase::Pending;
    }

    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    pub(crate) fn remember(&mut self, job: JobId, file: PathBuf) {
        self.lineage.insert(job, file);
    }

    pub(crate) fn record_outputs(&mut self, outputs: BTreeMap<JobId, PathBuf>) {
        self.outputs = Some(outputs);
    }
}
