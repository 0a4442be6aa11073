//! Run ledger.
//!
//! Results are keyed by stage and job identity, never by arrival order,
//! so out-of-order completion across workers is attributed correctly.

mod result;

pub use result::{AttemptCounts, JobFailure, JobOutcome, JobPhase, JobResult};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::errors::ChainError;
use crate::jobs::JobId;

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Results counted.
    pub total: usize,
    /// Succeeded jobs.
    pub succeeded: usize,
    /// Failed jobs.
    pub failed: usize,
    /// Skipped jobs.
    pub skipped: usize,
}

impl LedgerSummary {
    /// Counts one result.
    pub fn add(&mut self, outcome: JobOutcome) {
        self.total += 1;
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Jobs that left a file for the next stage.
    #[must_use]
    pub fn produced(&self) -> usize {
        self.succeeded + self.skipped
    }
}

impl<'a> FromIterator<&'a JobResult> for LedgerSummary {
    fn from_iter<I: IntoIterator<Item = &'a JobResult>>(iter: I) -> Self {
        let mut summary = Self::default();
        for result in iter {
            summary.add(result.outcome);
        }
        summary
    }
}

/// Every job result of a run.
#[derive(Debug, Clone, Default)]
pub struct ResultLedger {
    results: BTreeMap<(u32, JobId), JobResult>,
}

impl ResultLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result. A second result for the same stage and job is rejected.
    pub fn record(&mut self, result: JobResult) -> Result<(), ChainError> {
        let key = (result.stage, result.job.clone());
        if self.results.contains_key(&key) {
            return Err(ChainError::DuplicateResult {
                stage: key.0,
                job: key.1,
            });
        }
        self.results.insert(key, result);
        Ok(())
    }

    /// Records every result, stopping at the first duplicate.
    pub fn record_all(&mut self, results: impl IntoIterator<Item = JobResult>) -> Result<(), ChainError> {
        results.into_iter().try_for_each(|result| self.record(result))
    }

    /// Looks up one job.
    #[must_use]
    pub fn get(&self, stage: u32, job: &JobId) -> Option<&JobResult> {
        self.results.get(&(stage, job.clone()))
    }

    /// Results of one stage in job index order.
    #[must_use]
    pub fn stage_results(&self, stage: u32) -> Vec<&JobResult> {
        let mut results: Vec<&JobResult> = self.results.values().filter(|r| r.stage == stage).collect();
        results.sort_by_key(|r| r.index);
        results
    }

    /// Stage ordinals with at least one result, ascending.
    #[must_use]
    pub fn stages(&self) -> Vec<u32> {
        self.results
            .keys()
            .map(|(stage, _)| *stage)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every failed result.
    #[must_use]
    pub fn failures(&self) -> Vec<&JobResult> {
        self.results.values().filter(|r| r.is_failure()).collect()
    }

    /// All results, ordered by stage then identity.
    pub fn iter(&self) -> impl Iterator<Item = &JobResult> {
        self.results.values()
    }

    /// Number of recorded results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Counts across the whole run.
    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        self.results.values().collect()
    }

    /// Counts for one stage.
    #[must_use]
    pub fn stage_summary(&self, stage: u32) -> LedgerSummary {
        self.results.values().filter(|r| r.stage == stage).collect()
    }

    /// JSON report with overall and per-stage counts plus every result.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let stages: BTreeMap<String, LedgerSummary> = self
            .stages()
            .into_iter()
            .map(|stage| (stage.to_string(), self.stage_summary(stage)))
            .collect();
        let results: Vec<&JobResult> = self.results.values().collect();

        serde_json::json!({
            "summary": self.summary(),
            "stages": stages,
            "results": results,
        })
    }

    /// Writes [`Self::to_json`] to `path`, pretty-printed.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ChainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.to_json()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
