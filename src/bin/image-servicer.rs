use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use image_servicer::config::{load_run_config, LoadedConfig};
use image_servicer::control::{Operator, ResumeSignal, SuspendPoint};
use image_servicer::preflight::check_host_tools;
use image_servicer::report::store::{latest_run_id, load_runs, prune_old_runs, write_run};
use image_servicer::{
    DismEngine, MountHealth, MountManager, Orchestrator, RunReport, Stage, StageOutcome,
    StageStatus, VersionClassifier,
};

const DISM_LOG_FILENAME: &str = "dism.log";

fn usage() -> &'static str {
    "Usage:\n  image-servicer run <config.toml>\n  image-servicer inspect <config.toml>\n  image-servicer repair <config.toml> [--yes]\n  image-servicer classify <build>\n  image-servicer runs <working_dir>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config] if cmd == "run" => run(Path::new(config)),
        [cmd, config] if cmd == "inspect" => inspect(Path::new(config)),
        [cmd, config] if cmd == "repair" => repair(Path::new(config), false),
        [cmd, config, yes] if cmd == "repair" && (yes == "--yes" || yes == "-y") => {
            repair(Path::new(config), true)
        }
        [cmd, build] if cmd == "classify" => classify(build),
        [cmd, working_dir] if cmd == "runs" => list_runs(Path::new(working_dir)),
        _ => bail!(usage()),
    }
}

fn engine_for(loaded: &LoadedConfig) -> Arc<DismEngine> {
    Arc::new(DismEngine::from_path().with_log_path(loaded.working_dir.join(DISM_LOG_FILENAME)))
}

fn run(config_path: &Path) -> Result<()> {
    let loaded = load_run_config(config_path)?;
    check_host_tools()?;

    let ctx = loaded.run_context(engine_for(&loaded));
    let orchestrator = Orchestrator::new(&ctx, &loaded.stages, &loaded.plan)
        .context("loading the release table")?;

    println!(
        "[run] servicing '{}' index {}",
        loaded.image.display(),
        loaded.index
    );
    let report = orchestrator.run(&ConsoleOperator);

    let runs_dir = ctx.runs_dir();
    let report_path = write_run(&runs_dir, &report)?;
    prune_old_runs(&runs_dir, loaded.keep_runs)?;

    print_summary(&report);
    println!("[run] report: {}", report_path.display());

    if report.overall_status() == StageStatus::FatalFailure {
        bail!("servicing run {} aborted", report.run_id);
    }
    Ok(())
}

fn inspect(config_path: &Path) -> Result<()> {
    let loaded = load_run_config(config_path)?;
    let ctx = loaded.run_context(engine_for(&loaded));
    let health = MountManager::new(&ctx).inspect()?;
    println!("[mount] {}: {}", ctx.mount_point.display(), health);
    Ok(())
}

fn repair(config_path: &Path, yes: bool) -> Result<()> {
    let loaded = load_run_config(config_path)?;
    let ctx = loaded.run_context(engine_for(&loaded));
    let state = MountManager::new(&ctx).repair(yes || loaded.stages.auto_fix, &ConsoleOperator)?;
    println!("[mount] {}: {:?}", ctx.mount_point.display(), state);
    Ok(())
}

fn classify(raw: &str) -> Result<()> {
    let classification = VersionClassifier::windows()?.classify(raw);
    match classification.require_supported() {
        Ok(release) => {
            println!("{} -> {}", classification.raw, release);
            if let Some(note) = classification.ambiguity_note() {
                println!("note: {note}");
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn list_runs(working_dir: &Path) -> Result<()> {
    let runs_dir = working_dir.join("runs");
    let Some(latest) = latest_run_id(&runs_dir)? else {
        println!("no runs recorded under '{}'", working_dir.display());
        return Ok(());
    };
    println!("latest: {latest}");
    let runs = load_runs(&runs_dir)?;
    for run in runs {
        println!(
            "{}  {}  {}  {}",
            run.run_id,
            run.started_at_utc,
            run.status,
            if run.export_ready { "export-ready" } else { "-" }
        );
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    for outcome in report.outcomes.iter().filter(|o| o.status.is_failure()) {
        println!("[stage:{}] {}", outcome.stage, outcome.status);
        for failure in &outcome.failures {
            println!("    {}: {}", failure.item, failure.reason);
        }
    }
    for note in &report.notes {
        println!("[run] note: {note}");
    }
    println!("[run] {}: {}", report.run_id, report.overall_status());
}

/// Operator on the controlling terminal.
struct ConsoleOperator;

impl ConsoleOperator {
    fn prompt(&self, text: &str) -> String {
        print!("{text}");
        let _ = io::stdout().flush();
        let mut line = String::new();
        // EOF or a read error reads as an empty answer.
        let _ = io::stdin().lock().read_line(&mut line);
        line.trim().to_ascii_lowercase()
    }
}

impl Operator for ConsoleOperator {
    fn stage_started(&self, stage: Stage) {
        println!("[stage:{stage}] started");
    }

    fn stage_finished(&self, outcome: &StageOutcome) {
        println!("[stage:{}] {}", outcome.stage, outcome.status);
        for note in &outcome.notes {
            println!("[stage:{}] note: {note}", outcome.stage);
        }
    }

    fn item_progress(&self, stage: Stage, item: &str, position: usize, total: usize) {
        println!("[stage:{stage}] ({position}/{total}) {item}");
    }

    fn confirm_discard(&self, mount_point: &Path, health: MountHealth) -> bool {
        let answer = self.prompt(&format!(
            "Mount point '{}' is {health}. Discard its uncommitted changes? [y/N] ",
            mount_point.display()
        ));
        answer == "y" || answer == "yes"
    }

    fn await_resume(&self, point: SuspendPoint, mount_point: &Path) -> ResumeSignal {
        println!(
            "[pause] paused {point}; the image is mounted at '{}'",
            mount_point.display()
        );
        match self
            .prompt("Press Enter to resume, or type 'cancel' to stop the run: ")
            .as_str()
        {
            "cancel" | "c" => ResumeSignal::Cancel,
            _ => ResumeSignal::Resume,
        }
    }
}
