//! Run reports.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::ledger::{LedgerSummary, ResultLedger};

/// What one stage did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Stage ordinal (0 for batch runs).
    pub ordinal: u32,
    /// Directory the stage read from.
    pub input_dir: PathBuf,
    /// Directory the stage wrote to.
    pub output_dir: PathBuf,
    /// Jobs run.
    pub total: usize,
    /// Jobs that wrote an output.
    pub succeeded: usize,
    /// Jobs without output.
    pub failed: usize,
    /// Jobs that reused an existing output.
    pub skipped: usize,
    /// Jobs fed from an earlier stage's file.
    pub carried_forward: usize,
    /// Wall-clock time of the stage in milliseconds.
    pub duration_ms: u64,
}

impl StageReport {
    /// Jobs that left a file for the next stage.
    #[must_use]
    pub fn produced(&self) -> usize {
        self.succeeded + self.skipped
    }

    pub(crate) fn from_summary(
        ordinal: u32,
        input_dir: PathBuf,
        output_dir: PathBuf,
        summary: LedgerSummary,
        carried_forward: usize,
        duration: Duration,
    ) -> Self {
        Self {
            ordinal,
            input_dir,
            output_dir,
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            carried_forward,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct ChainReport {
    /// Run id.
    pub run_id: Uuid,
    /// One report per executed stage, in order.
    pub stages: Vec<StageReport>,
    /// Every job result.
    pub ledger: ResultLedger,
    /// Stage after which the chain stopped early.
    pub halted_after: Option<u32>,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl ChainReport {
    /// Counts across all stages.
    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        self.ledger.summary()
    }

    /// Report of one stage, if it ran.
    #[must_use]
    pub fn stage(&self, ordinal: u32) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.ordinal == ordinal)
    }

    /// Ordinals of the executed stages.
    #[must_use]
    pub fn executed_stages(&self) -> Vec<u32> {
        self.stages.iter().map(|s| s.ordinal).collect()
    }

    /// JSON form: run id, halt marker, stage reports and the full ledger.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "halted_after": self.halted_after,
            "duration_ms": u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            "stages": self.stages,
            "ledger": self.ledger.to_json(),
        })
    }
}
