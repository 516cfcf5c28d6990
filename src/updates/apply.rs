//! Package application with a single bounded fallback.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use super::{classify_container, ContainerFormat, UpdatePackage};
use crate::context::RunContext;
use crate::control::Operator;
use crate::engine::{EngineError, EngineErrorKind};
use crate::error::Result;
use crate::mount::MountSession;
use crate::pipeline::Stage;

/// Name of the scan catalog that ships inside wrapped updates.
const SCAN_CATALOG: &str = "wsusscan.cab";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum ApplyResult {
    Applied,
    /// The engine accepted the payload but it does not target this image.
    NotApplicable(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageOutcome {
    pub id: String,
    pub result: ApplyResult,
    /// Interpretations tried: 1, or 2 when the fallback ran.
    pub attempts: u8,
    /// Interpretation that produced `result`.
    pub format_used: ContainerFormat,
}

impl PackageOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, ApplyResult::Failed(_))
    }
}

/// Outcomes of the update loop, in apply order.
#[derive(Debug, Clone, Default)]
pub struct UpdateRun {
    pub outcomes: Vec<PackageOutcome>,
    /// True when cancellation stopped the loop before every package ran.
    pub cancelled: bool,
}

/// Apply one package, retrying once with the alternate interpretation when the
/// engine reports a format mismatch.
///
/// The engine picks its interpretation from the file extension, so a package
/// whose name disagrees with its declared format is first staged under the
/// declared extension.
///
/// Item failures are returned inside the outcome; `Err` is reserved for losing
/// the session record.
pub fn apply(
    ctx: &RunContext,
    session: &mut MountSession,
    package: &UpdatePackage,
) -> Result<PackageOutcome> {
    session.mark_dirty()?;
    let mount_point = session.mount_point().to_path_buf();
    let scratch = ctx.scratch_dir(&package.id);
    let outcome = apply_with_fallback(ctx, &mount_point, package, &scratch);
    if scratch.exists() {
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(path = %scratch.display(), error = %e, "could not remove scratch directory");
        }
    }
    Ok(outcome)
}

fn apply_with_fallback(
    ctx: &RunContext,
    mount_point: &Path,
    package: &UpdatePackage,
    scratch: &Path,
) -> PackageOutcome {
    let declared = package.declared_format;
    let first = if has_extension_for(&package.path, declared) {
        ctx.engine().add_package(mount_point, &package.path)
    } else {
        info!(
            package = %package.id,
            declared = %declared,
            "file name disagrees with declared format; staging declared interpretation"
        );
        apply_as(ctx, mount_point, package, declared, scratch)
    };
    let first_err = match first {
        Ok(()) => return outcome(package, ApplyResult::Applied, 1, declared),
        Err(e) if e.is_format_mismatch() => e,
        Err(e) => return outcome(package, result_from(&e, None), 1, declared),
    };

    let alternate = declared.alternate();
    info!(
        package = %package.id,
        declared = %declared,
        fallback = %alternate,
        error = %first_err,
        "format mismatch; retrying with alternate container interpretation"
    );

    let result = match apply_as(ctx, mount_point, package, alternate, scratch) {
        Ok(()) => ApplyResult::Applied,
        Err(e) => result_from(&e, Some((declared, &first_err))),
    };
    outcome(package, result, 2, alternate)
}

fn has_extension_for(path: &Path, format: ContainerFormat) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(format.extension()))
}

/// Apply `packages` in order, stopping before the next package once the run's
/// cancellation token is set.
pub fn apply_all(
    ctx: &RunContext,
    session: &mut MountSession,
    packages: &[UpdatePackage],
    operator: &dyn Operator,
) -> Result<UpdateRun> {
    let mut run = UpdateRun::default();
    for (position, package) in packages.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            warn!(
                remaining = packages.len() - position,
                "cancellation requested; stopping update loop"
            );
            run.cancelled = true;
            break;
        }
        operator.item_progress(Stage::Updates, &package.id, position + 1, packages.len());

        let outcome = apply(ctx, session, package)?;
        match &outcome.result {
            ApplyResult::Applied => info!(
                package = %outcome.id,
                attempts = outcome.attempts,
                format = %outcome.format_used,
                "package applied"
            ),
            ApplyResult::NotApplicable(reason) => {
                info!(package = %outcome.id, %reason, "package not applicable")
            }
            ApplyResult::Failed(reason) => {
                warn!(package = %outcome.id, attempts = outcome.attempts, %reason, "package failed")
            }
        }
        run.outcomes.push(outcome);
    }
    Ok(run)
}

fn outcome(
    package: &UpdatePackage,
    result: ApplyResult,
    attempts: u8,
    format_used: ContainerFormat,
) -> PackageOutcome {
    PackageOutcome {
        id: package.id.clone(),
        result,
        attempts,
        format_used,
    }
}

fn result_from(err: &EngineError, first: Option<(ContainerFormat, &EngineError)>) -> ApplyResult {
    let message = match first {
        Some((declared, first_err)) => format!(
            "{declared} interpretation rejected ({first_err}); alternate also failed: {err}"
        ),
        None => err.to_string(),
    };
    match err.kind {
        EngineErrorKind::NotApplicable => ApplyResult::NotApplicable(message),
        _ => ApplyResult::Failed(message),
    }
}

/// Re-derive `package` in `format` under `scratch` and apply it.
fn apply_as(
    ctx: &RunContext,
    mount_point: &Path,
    package: &UpdatePackage,
    format: ContainerFormat,
    scratch: &Path,
) -> std::result::Result<(), EngineError> {
    reset_dir(scratch).map_err(|e| staging_error(scratch, e))?;

    let payloads = match format {
        ContainerFormat::Bare if actually_wrapped(&package.path) => {
            let extracted = ctx.engine().expand_package(&package.path, scratch)?;
            let payloads = bare_payloads(extracted);
            if payloads.is_empty() {
                return Err(EngineError::local(
                    "expand",
                    format!("'{}' contained no servicing payloads", package.path.display()),
                ));
            }
            payloads
        }
        _ => vec![relabel(&package.path, scratch, format)?],
    };

    for payload in &payloads {
        ctx.engine().add_package(mount_point, payload)?;
    }
    Ok(())
}

fn actually_wrapped(path: &Path) -> bool {
    matches!(classify_container(path), Ok(ContainerFormat::Wrapped))
}

fn bare_payloads(mut extracted: Vec<PathBuf>) -> Vec<PathBuf> {
    extracted.retain(|p| {
        let name = p
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_default();
        name.ends_with(".cab") && name != SCAN_CATALOG
    });
    extracted.sort();
    extracted
}

/// Link (or copy) `source` into `scratch` with the extension for `format`.
fn relabel(source: &Path, scratch: &Path, format: ContainerFormat) -> std::result::Result<PathBuf, EngineError> {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("package");
    let dest = scratch.join(format!("{stem}.{}", format.extension()));
    if fs::hard_link(source, &dest).is_err() {
        fs::copy(source, &dest).map_err(|e| staging_error(&dest, e))?;
    }
    Ok(dest)
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

fn staging_error(path: &Path, err: std::io::Error) -> EngineError {
    EngineError::local(
        "stage-alternate",
        format!("preparing '{}': {err}", path.display()),
    )
}
