//! Run report persistence under `<workdir>/runs/<run-id>/`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{RunReport, StageStatus};
use crate::context::sanitize;
use crate::timestamp::format_utc_compact;

pub const RUN_REPORT_FILENAME: &str = "run-report.json";
pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
/// Runs kept by [`prune_old_runs`] unless configured otherwise.
pub const DEFAULT_KEEP_RUNS: usize = 10;

/// Nanoseconds (< 2^30) shifted past a 16-bit sequence fit in 9 base-36 digits.
const RUN_ID_TICK_WIDTH: usize = 9;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Small summary stored next to each report, read when listing runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: StageStatus,
    pub export_ready: bool,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
}

impl RunManifest {
    fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            status: report.overall_status(),
            export_ready: report.should_export(),
            started_at_utc: report.started_at_utc.clone(),
            finished_at_utc: report.finished_at_utc.clone(),
        }
    }
}

/// Identifier for a run of `image` index `index`:
/// `<UTC stamp>.<tick>-<image stem>-<index>`, e.g.
/// `20261018T120304Z.0b2k9xq1a-install-1`.
///
/// The stamp and fixed-width tick make ids sort by start time; the image part
/// makes a run directory recognizable when listing. Runs of one working
/// directory are serialized by the mount lock, so the in-process sequence is
/// enough to separate runs started within the same nanosecond.
pub fn generate_run_id(image: &Path, index: u32) -> String {
    let now = OffsetDateTime::now_utc();
    let seq = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
    let tick = (u64::from(now.nanosecond()) << 16) | seq;
    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    format!(
        "{}.{}-{}-{}",
        format_utc_compact(now),
        base36_fixed(tick),
        sanitize(stem).to_ascii_lowercase(),
        index
    )
}

/// Base-36 digits of `value`, zero-padded to [`RUN_ID_TICK_WIDTH`].
fn base36_fixed(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = [b'0'; RUN_ID_TICK_WIDTH];
    for slot in out.iter_mut().rev() {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    out.iter().map(|&b| b as char).collect()
}

/// Write the report and its manifest into a fresh run directory.
pub fn write_run(runs_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = runs_dir.join(&report.run_id);
    if run_dir.exists() {
        bail!("run directory '{}' already exists", run_dir.display());
    }
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;

    let report_path = run_dir.join(RUN_REPORT_FILENAME);
    write_json_atomic(&report_path, report)
        .with_context(|| format!("writing run report '{}'", report_path.display()))?;
    let manifest_path = run_dir.join(RUN_MANIFEST_FILENAME);
    write_json_atomic(&manifest_path, &RunManifest::from_report(report))
        .with_context(|| format!("writing run manifest '{}'", manifest_path.display()))?;
    Ok(report_path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run data")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Manifests of every completed run, newest first.
pub fn load_runs(runs_dir: &Path) -> Result<Vec<RunManifest>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let path = run_dir.join(RUN_MANIFEST_FILENAME);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(sort_key(run)));
    Ok(runs)
}

pub fn latest_run_id(runs_dir: &Path) -> Result<Option<String>> {
    Ok(load_runs(runs_dir)?.into_iter().next().map(|r| r.run_id))
}

/// Delete all but the `keep` newest runs.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<()> {
    for run in load_runs(runs_dir)?.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn sort_key(run: &RunManifest) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.started_at_utc.clone()),
        run.run_id.clone(),
    )
}
