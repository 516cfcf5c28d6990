//! Failure aggregation for one servicing run.
//!
//! Every stage records exactly one [`StageOutcome`]. The resulting
//! [`RunReport`] is returned to the caller on every path and gates export.

pub mod store;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::error::{Result, ServicingError};
use crate::pipeline::Stage;
use crate::timestamp::now_utc_compact;
use crate::updates::PackageOutcome;
use crate::version::VersionClassification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    PartialFailure,
    FatalFailure,
    Skipped,
}

impl StageStatus {
    /// Severity used for the overall status. A skipped stage is not a failure.
    fn severity(self) -> u8 {
        match self {
            StageStatus::Succeeded | StageStatus::Skipped => 0,
            StageStatus::PartialFailure => 1,
            StageStatus::FatalFailure => 2,
        }
    }

    pub fn is_failure(self) -> bool {
        self.severity() > 0
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::PartialFailure => write!(f, "partial failure"),
            StageStatus::FatalFailure => write!(f, "fatal failure"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One item a stage could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ItemFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl StageOutcome {
    pub fn new(stage: Stage, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            failures: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn skipped(stage: Stage, note: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Skipped).with_note(note)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Ordered stage outcomes for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub image: PathBuf,
    pub index: u32,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub classification: Option<VersionClassification>,
    pub outcomes: Vec<StageOutcome>,
    /// Per-package results of the update stage.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageOutcome>,
    /// Run-level notes not tied to a stage, such as cleanup problems.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl RunReport {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            run_id: store::generate_run_id(&ctx.image, ctx.index),
            image: ctx.image.clone(),
            index: ctx.index,
            started_at_utc: now_utc_compact(),
            finished_at_utc: None,
            classification: None,
            outcomes: Vec::new(),
            packages: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Append the outcome for a stage. A stage records at most once.
    pub fn record(&mut self, outcome: StageOutcome) -> Result<()> {
        if self.outcome(outcome.stage).is_some() {
            return Err(ServicingError::DuplicateOutcome(outcome.stage));
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    /// Worst recorded status; `Succeeded` when nothing failed.
    pub fn overall_status(&self) -> StageStatus {
        self.outcomes
            .iter()
            .map(|o| o.status)
            .filter(|s| s.is_failure())
            .max_by_key(|s| s.severity())
            .unwrap_or(StageStatus::Succeeded)
    }

    /// Export only proceeds from a committed image.
    pub fn should_export(&self) -> bool {
        self.outcome(Stage::Commit)
            .is_some_and(|o| o.status == StageStatus::Succeeded)
    }

    pub fn finish(&mut self) {
        self.finished_at_utc = Some(now_utc_compact());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::testutil::Fixture;

    fn report() -> (Fixture, RunReport) {
        let f = Fixture::new(FakeEngine::new());
        let report = RunReport::new(&f.ctx);
        (f, report)
    }

    #[test]
    fn test_duplicate_outcome_rejected() {
        let (_f, mut report) = report();
        report
            .record(StageOutcome::new(Stage::Drivers, StageStatus::Succeeded))
            .unwrap();
        let err = report
            .record(StageOutcome::new(Stage::Drivers, StageStatus::FatalFailure))
            .unwrap_err();
        assert!(matches!(err, ServicingError::DuplicateOutcome(Stage::Drivers)));
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, StageStatus::Succeeded);
    }

    #[test]
    fn test_overall_status_is_worst_observed() {
        let (_f, mut report) = report();
        assert_eq!(report.overall_status(), StageStatus::Succeeded);

        report
            .record(StageOutcome::skipped(Stage::Drivers, "disabled"))
            .unwrap();
        assert_eq!(report.overall_status(), StageStatus::Succeeded);

        let mut partial = StageOutcome::new(Stage::Updates, StageStatus::PartialFailure);
        partial.failures.push(ItemFailure::new("KB1", "boom"));
        report.record(partial).unwrap();
        assert_eq!(report.overall_status(), StageStatus::PartialFailure);

        report
            .record(StageOutcome::new(Stage::RegistryPolicy, StageStatus::FatalFailure))
            .unwrap();
        report
            .record(StageOutcome::new(Stage::ScriptHooks, StageStatus::Succeeded))
            .unwrap();
        assert_eq!(report.overall_status(), StageStatus::FatalFailure);
    }

    #[test]
    fn test_should_export_requires_committed_image() {
        let (_f, mut report) = report();
        assert!(!report.should_export());
        report
            .record(StageOutcome::skipped(Stage::Commit, "disabled"))
            .unwrap();
        assert!(!report.should_export());

        let (_f, mut report) = self::report();
        report
            .record(StageOutcome::new(Stage::Commit, StageStatus::Succeeded))
            .unwrap();
        assert!(report.should_export());
    }
}
