use std::fs;

use tracing::{info, warn};

use super::{FailurePolicy, ServicingPlan, Stage, StageConfig};
use crate::context::RunContext;
use crate::control::{Operator, ResumeSignal, SuspendPoint};
use crate::error::Result;
use crate::mount::{MountHealth, MountManager, MountSession};
use crate::report::{ItemFailure, RunReport, StageOutcome, StageStatus};
use crate::stages::{
    apply_drivers, apply_language, apply_registry, remove_provisioned, run_hooks, StageWork,
};
use crate::updates::{apply_all, resolve_applicable, ApplyResult};
use crate::version::VersionClassifier;

/// Drives one servicing run from validation to export.
///
/// The orchestrator alone decides when a run halts and is the only caller of
/// the discard path: any session still open after the stage loop is released
/// without commit before the report is returned.
pub struct Orchestrator<'a> {
    ctx: &'a RunContext,
    config: &'a StageConfig,
    plan: &'a ServicingPlan,
    classifier: VersionClassifier,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a RunContext, config: &'a StageConfig, plan: &'a ServicingPlan) -> Result<Self> {
        Ok(Self::with_classifier(ctx, config, plan, VersionClassifier::windows()?))
    }

    pub fn with_classifier(
        ctx: &'a RunContext,
        config: &'a StageConfig,
        plan: &'a ServicingPlan,
        classifier: VersionClassifier,
    ) -> Self {
        Self {
            ctx,
            config,
            plan,
            classifier,
        }
    }

    /// Run every stage in order. Always returns a complete report.
    pub fn run(&self, operator: &dyn Operator) -> RunReport {
        let mut report = RunReport::new(self.ctx);
        let manager = MountManager::new(self.ctx);
        let mut session: Option<MountSession> = None;
        let mut halted_by: Option<Stage> = None;

        info!(
            run_id = %report.run_id,
            image = %self.ctx.image.display(),
            index = self.ctx.index,
            "servicing run started"
        );

        for stage in Stage::ORDER {
            let outcome = if let Some(cause) = halted_by {
                StageOutcome::skipped(stage, format!("skipped after fatal failure in {cause}"))
            } else if self.ctx.cancel.is_cancelled() {
                StageOutcome::new(stage, StageStatus::FatalFailure)
                    .with_note("run cancelled before the stage started")
            } else if !self.config.is_enabled(stage) {
                StageOutcome::skipped(stage, "disabled by configuration")
            } else {
                operator.stage_started(stage);
                self.run_stage(stage, &manager, &mut session, &mut report, operator)
            };

            match outcome.status {
                StageStatus::FatalFailure => {
                    warn!(%stage, failures = outcome.failures.len(), "stage failed fatally");
                    halted_by.get_or_insert(stage);
                }
                StageStatus::PartialFailure => {
                    warn!(%stage, failures = outcome.failures.len(), "stage finished with failures")
                }
                status => info!(%stage, %status, "stage finished"),
            }
            operator.stage_finished(&outcome);
            if let Err(e) = report.record(outcome) {
                warn!(error = %e, "stage outcome not recorded");
            }
        }

        if let Some(open) = session.take() {
            info!(mount_point = %open.mount_point().display(), "discarding uncommitted mount");
            if let Err(e) = manager.release(open, false) {
                warn!(error = %e, "discarding the mount failed");
                report
                    .notes
                    .push(format!("discarding the mount failed: {e}; run repair before the next run"));
            }
        }

        report.finish();
        info!(
            run_id = %report.run_id,
            status = %report.overall_status(),
            export_ready = report.should_export(),
            "servicing run finished"
        );
        report
    }

    fn run_stage(
        &self,
        stage: Stage,
        manager: &MountManager<'_>,
        session: &mut Option<MountSession>,
        report: &mut RunReport,
        operator: &dyn Operator,
    ) -> StageOutcome {
        let ctx = self.ctx;
        let plan = self.plan;
        match stage {
            Stage::Validate => self.validate(manager, report, operator),
            Stage::Mount => self.mount(manager, session, operator),
            Stage::Drivers => self.content(stage, session, |open| {
                apply_drivers(ctx, open, &plan.drivers, operator)
            }),
            Stage::Updates => self.content(stage, session, |open| self.updates(open, report, operator)),
            Stage::LanguageResources => self.content(stage, session, |open| {
                apply_language(ctx, open, &plan.language, operator)
            }),
            Stage::PackageRemoval => self.content(stage, session, |open| {
                remove_provisioned(ctx, open, &plan.removals, operator)
            }),
            Stage::RegistryPolicy => self.content(stage, session, |open| {
                apply_registry(ctx, open, &plan.registry, operator)
            }),
            Stage::ScriptHooks => {
                let release = report
                    .classification
                    .as_ref()
                    .and_then(|c| c.release.as_ref());
                self.content(stage, session, |open| {
                    run_hooks(ctx, open, &plan.hooks, release, operator)
                })
            }
            Stage::Commit => self.commit(manager, session, operator),
            Stage::Export => self.export(report),
        }
    }

    /// Repair stale mounts, then classify the image build.
    fn validate(
        &self,
        manager: &MountManager<'_>,
        report: &mut RunReport,
        operator: &dyn Operator,
    ) -> StageOutcome {
        let stage = Stage::Validate;
        let mut outcome = StageOutcome::new(stage, StageStatus::Succeeded);
        let mount_label = self.ctx.mount_point.display().to_string();

        match manager.inspect() {
            Ok(MountHealth::Clean) => {}
            Ok(health) => {
                outcome
                    .notes
                    .push(format!("found {health} mount at '{mount_label}'"));
                if let Err(e) = manager.repair(self.config.auto_fix, operator) {
                    return fatal(outcome, mount_label, e.to_string());
                }
                outcome.notes.push("stale mount discarded".to_string());
            }
            Err(e) => return fatal(outcome, mount_label, e.to_string()),
        }

        let image_label = format!("{}:{}", self.ctx.image.display(), self.ctx.index);
        let info = match self.ctx.engine().image_info(&self.ctx.image, self.ctx.index) {
            Ok(info) => info,
            Err(e) => return fatal(outcome, image_label, e.to_string()),
        };
        info!(
            name = %info.name,
            edition = info.edition.as_deref().unwrap_or("unknown"),
            version = %info.version,
            "source image"
        );

        let classification = self.classifier.classify(&info.version);
        if let Some(note) = classification.ambiguity_note() {
            outcome.notes.push(note);
        }
        let supported = classification.require_supported().map(|_| ());
        report.classification = Some(classification);
        match supported {
            Ok(()) => outcome,
            Err(e) => fatal(outcome, info.version, e.to_string()),
        }
    }

    fn mount(
        &self,
        manager: &MountManager<'_>,
        session: &mut Option<MountSession>,
        operator: &dyn Operator,
    ) -> StageOutcome {
        let open = match manager.acquire() {
            Ok(open) => open,
            Err(e) => {
                let mut work = StageWork::default();
                work.fail(self.ctx.image.display().to_string(), e.to_string());
                return self.conclude(Stage::Mount, work);
            }
        };
        let mount_point = open.mount_point().to_path_buf();
        *session = Some(open);

        let outcome = StageOutcome::new(Stage::Mount, StageStatus::Succeeded);
        if self.config.pause_after_mount
            && operator.await_resume(SuspendPoint::AfterMount, &mount_point) == ResumeSignal::Cancel
        {
            // The next stage, enabled or not, records the cancellation.
            self.ctx.cancel.cancel();
            return outcome.with_note("operator cancelled at the pause after mount");
        }
        outcome
    }

    fn content(
        &self,
        stage: Stage,
        session: &mut Option<MountSession>,
        apply: impl FnOnce(&mut MountSession) -> Result<StageWork>,
    ) -> StageOutcome {
        let Some(open) = session.as_mut() else {
            return StageOutcome::skipped(stage, "no mounted image");
        };
        match apply(open) {
            Ok(work) => self.conclude(stage, work),
            // The session record could not be persisted: crash recovery is
            // no longer reliable, so stop regardless of policy.
            Err(e) => fatal(
                StageOutcome::new(stage, StageStatus::Succeeded),
                stage.as_str(),
                e.to_string(),
            ),
        }
    }

    fn updates(
        &self,
        open: &mut MountSession,
        report: &mut RunReport,
        operator: &dyn Operator,
    ) -> Result<StageWork> {
        let mut work = StageWork::default();
        let Some(classification) = report.classification.as_ref() else {
            work.fail("updates", "image build was not classified");
            return Ok(work);
        };
        let ordered = match resolve_applicable(&self.plan.updates, classification) {
            Ok(ordered) => ordered,
            Err(e) => {
                work.fail("updates", e.to_string());
                return Ok(work);
            }
        };
        let filtered = self.plan.updates.len() - ordered.len();
        if filtered > 0 {
            work.note(format!(
                "{filtered} candidate package(s) superseded or targeting another release"
            ));
        }

        let run = apply_all(self.ctx, open, &ordered, operator)?;
        for outcome in &run.outcomes {
            match &outcome.result {
                ApplyResult::Applied => {}
                ApplyResult::NotApplicable(reason) => work.note(format!("{}: {reason}", outcome.id)),
                ApplyResult::Failed(reason) => work.fail(outcome.id.clone(), reason.clone()),
            }
        }
        work.cancelled = run.cancelled;
        report.packages = run.outcomes;
        Ok(work)
    }

    fn commit(
        &self,
        manager: &MountManager<'_>,
        session: &mut Option<MountSession>,
        operator: &dyn Operator,
    ) -> StageOutcome {
        let stage = Stage::Commit;
        let Some(mount_point) = session.as_ref().map(|s| s.mount_point().to_path_buf()) else {
            return StageOutcome::skipped(stage, "no mounted image");
        };

        if self.config.pause_before_commit
            && operator.await_resume(SuspendPoint::BeforeCommit, &mount_point) == ResumeSignal::Cancel
        {
            self.ctx.cancel.cancel();
            return StageOutcome::new(stage, StageStatus::FatalFailure)
                .with_note("operator cancelled at the pause before commit");
        }

        let Some(open) = session.take() else {
            return StageOutcome::skipped(stage, "no mounted image");
        };
        match manager.release(open, true) {
            Ok(_) => StageOutcome::new(stage, StageStatus::Succeeded),
            Err(e) => {
                let mut work = StageWork::default();
                work.fail(mount_point.display().to_string(), e.to_string());
                self.conclude(stage, work)
            }
        }
    }

    fn export(&self, report: &RunReport) -> StageOutcome {
        let stage = Stage::Export;
        let Some(target) = &self.plan.export else {
            return StageOutcome::skipped(stage, "no export artifact requested");
        };
        if !report.should_export() {
            return StageOutcome::skipped(stage, "image was not committed");
        }

        let mut work = StageWork::default();
        let label = target.destination.display().to_string();
        if let Some(parent) = target.destination.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                work.fail(label, format!("creating '{}': {e}", parent.display()));
                return self.conclude(stage, work);
            }
        }
        match self.ctx.engine().export_image(
            &self.ctx.image,
            self.ctx.index,
            &target.destination,
            target.name.as_deref(),
        ) {
            Ok(()) => work.note(format!("exported to '{label}'")),
            Err(e) => work.fail(label, e.to_string()),
        }
        self.conclude(stage, work)
    }

    /// Apply the stage's failure policy to its accumulated work.
    fn conclude(&self, stage: Stage, work: StageWork) -> StageOutcome {
        let mut outcome = StageOutcome::new(stage, StageStatus::Succeeded);
        outcome.notes = work.notes;
        outcome.failures = work.failures;
        if work.cancelled {
            outcome.status = StageStatus::FatalFailure;
            outcome.notes.push("run cancelled during the stage".to_string());
        } else if !outcome.failures.is_empty() {
            outcome.status = match self.config.policy(stage) {
                FailurePolicy::AbortPipeline => StageStatus::FatalFailure,
                FailurePolicy::ContinueOnError => StageStatus::PartialFailure,
            };
        }
        outcome
    }
}

fn fatal(mut outcome: StageOutcome, item: impl Into<String>, reason: String) -> StageOutcome {
    outcome.status = StageStatus::FatalFailure;
    outcome.failures.push(ItemFailure::new(item, reason));
    outcome
}
