//! Run file loading.
//!
//! A run file is TOML. Relative paths inside it resolve against the file's own
//! directory. Loading yields plain values: where to operate, a
//! [`StageConfig`] and a [`ServicingPlan`].
//!
//! ```toml
//! [image]
//! path = "media/sources/install.wim"
//! index = 6
//! mount_point = "mount"
//!
//! [stages]
//! drivers = false
//!
//! [policy]
//! updates = "abort_pipeline"
//!
//! [[updates]]
//! id = "KB5031455"
//! path = "updates/windows11.0-kb5031455-x64.msu"
//! release = "Windows 11 23H2"
//! class = "cumulative"
//! supersedes = ["KB5030310"]
//!
//! [export]
//! destination = "out/install.wim"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::context::{default_working_dir, RunContext};
use crate::engine::ImageEngine;
use crate::pipeline::{ExportTarget, FailurePolicy, ServicingPlan, Stage, StageConfig};
use crate::report::store::DEFAULT_KEEP_RUNS;
use crate::stages::{DriverSource, LanguageItem, OfflineHive, RegistryImport, ScriptHook};
use crate::updates::{classify_container, ContainerFormat, UpdateClass, UpdatePackage};
use crate::version::ReleaseId;

/// A parsed run file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_path: PathBuf,
    pub image: PathBuf,
    pub index: u32,
    pub mount_point: PathBuf,
    pub working_dir: PathBuf,
    pub stages: StageConfig,
    pub plan: ServicingPlan,
    /// Run reports kept under the working directory.
    pub keep_runs: usize,
}

impl LoadedConfig {
    pub fn run_context(&self, engine: Arc<dyn ImageEngine>) -> RunContext {
        RunContext::new(
            engine,
            self.working_dir.clone(),
            self.mount_point.clone(),
            self.image.clone(),
            self.index,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunToml {
    image: ImageToml,
    #[serde(default)]
    stages: StagesToml,
    #[serde(default)]
    policy: PolicyToml,
    #[serde(default)]
    pause: PauseToml,
    #[serde(default)]
    repair: RepairToml,
    #[serde(default)]
    drivers: Vec<DriverToml>,
    #[serde(default)]
    updates: Vec<UpdateToml>,
    #[serde(default)]
    language: Vec<LanguageToml>,
    removal: Option<RemovalToml>,
    #[serde(default)]
    registry: Vec<RegistryToml>,
    #[serde(default)]
    hooks: Vec<HookToml>,
    export: Option<ExportToml>,
    runs: Option<RunsToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    path: String,
    index: u32,
    mount_point: String,
    working_dir: Option<String>,
}

/// Enable flags. `validate` is deliberately absent: it always runs.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StagesToml {
    mount: Option<bool>,
    drivers: Option<bool>,
    updates: Option<bool>,
    language_resources: Option<bool>,
    package_removal: Option<bool>,
    registry_policy: Option<bool>,
    script_hooks: Option<bool>,
    commit: Option<bool>,
    export: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyToml {
    mount: Option<String>,
    drivers: Option<String>,
    updates: Option<String>,
    language_resources: Option<String>,
    package_removal: Option<String>,
    registry_policy: Option<String>,
    script_hooks: Option<String>,
    commit: Option<String>,
    export: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PauseToml {
    #[serde(default)]
    after_mount: bool,
    #[serde(default)]
    before_commit: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepairToml {
    #[serde(default)]
    auto_fix: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DriverToml {
    path: String,
    recurse: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateToml {
    id: String,
    path: String,
    release: String,
    class: String,
    format: Option<String>,
    #[serde(default)]
    supersedes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LanguageToml {
    kind: String,
    path: Option<String>,
    name: Option<String>,
    source: Option<String>,
    license: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemovalToml {
    #[serde(default)]
    prefixes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryToml {
    file: String,
    hive: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HookToml {
    name: String,
    program: String,
    #[serde(default)]
    args: Vec<String>,
    working_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExportToml {
    destination: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunsToml {
    keep: usize,
}

pub fn load_run_config(config_path: &Path) -> Result<LoadedConfig> {
    let text = fs::read_to_string(config_path)
        .with_context(|| format!("reading run file '{}'", config_path.display()))?;
    let base = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    parse_run_config(&text, &base, config_path)
}

/// Parse run file `text`, resolving relative paths against `base`.
pub fn parse_run_config(text: &str, base: &Path, config_path: &Path) -> Result<LoadedConfig> {
    let parsed: RunToml = toml::from_str(text)
        .with_context(|| format!("parsing run file '{}'", config_path.display()))?;
    let invalid = |msg: String| anyhow!("invalid run file '{}': {msg}", config_path.display());

    if parsed.image.index == 0 {
        return Err(invalid("image.index is 1-based".to_string()));
    }

    let stages = stage_config(&parsed).map_err(|e| invalid(e.to_string()))?;

    let drivers = parsed
        .drivers
        .iter()
        .map(|d| DriverSource {
            path: resolve_path(base, &d.path),
            recurse: d.recurse.unwrap_or(true),
        })
        .collect();

    let updates = parsed
        .updates
        .iter()
        .map(|u| update_package(base, u))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| invalid(format!("{e:#}")))?;

    let language = parsed
        .language
        .iter()
        .map(|l| language_item(base, l))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| invalid(e.to_string()))?;

    let registry = parsed
        .registry
        .iter()
        .map(|r| -> Result<RegistryImport> {
            Ok(RegistryImport {
                file: resolve_path(base, &r.file),
                hive: r.hive.parse::<OfflineHive>().map_err(|e| anyhow!(e))?,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|e| invalid(e.to_string()))?;

    let hooks = parsed
        .hooks
        .iter()
        .map(|h| ScriptHook {
            name: h.name.clone(),
            program: resolve_program(base, &h.program),
            args: h.args.clone(),
            working_dir: h.working_dir.as_deref().map(|d| resolve_path(base, d)),
        })
        .collect();

    let removals = parsed
        .removal
        .map(|r| {
            r.prefixes
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let export = parsed.export.map(|e| ExportTarget {
        destination: resolve_path(base, &e.destination),
        name: e.name,
    });

    Ok(LoadedConfig {
        config_path: config_path.to_path_buf(),
        image: resolve_path(base, &parsed.image.path),
        index: parsed.image.index,
        mount_point: resolve_path(base, &parsed.image.mount_point),
        working_dir: parsed
            .image
            .working_dir
            .as_deref()
            .map(|d| resolve_path(base, d))
            .unwrap_or_else(default_working_dir),
        stages,
        plan: ServicingPlan {
            drivers,
            updates,
            language,
            removals,
            registry,
            hooks,
            export,
        },
        keep_runs: parsed.runs.map(|r| r.keep).unwrap_or(DEFAULT_KEEP_RUNS),
    })
}

fn stage_config(parsed: &RunToml) -> Result<StageConfig> {
    let mut config = StageConfig {
        pause_after_mount: parsed.pause.after_mount,
        pause_before_commit: parsed.pause.before_commit,
        auto_fix: parsed.repair.auto_fix,
        ..StageConfig::default()
    };

    let s = &parsed.stages;
    let flags = [
        (Stage::Mount, s.mount),
        (Stage::Drivers, s.drivers),
        (Stage::Updates, s.updates),
        (Stage::LanguageResources, s.language_resources),
        (Stage::PackageRemoval, s.package_removal),
        (Stage::RegistryPolicy, s.registry_policy),
        (Stage::ScriptHooks, s.script_hooks),
        (Stage::Commit, s.commit),
        (Stage::Export, s.export),
    ];
    for (stage, enabled) in flags {
        if let Some(enabled) = enabled {
            config.set_enabled(stage, enabled);
        }
    }

    let p = &parsed.policy;
    let policies = [
        (Stage::Mount, &p.mount),
        (Stage::Drivers, &p.drivers),
        (Stage::Updates, &p.updates),
        (Stage::LanguageResources, &p.language_resources),
        (Stage::PackageRemoval, &p.package_removal),
        (Stage::RegistryPolicy, &p.registry_policy),
        (Stage::ScriptHooks, &p.script_hooks),
        (Stage::Commit, &p.commit),
        (Stage::Export, &p.export),
    ];
    for (stage, raw) in policies {
        if let Some(raw) = raw {
            config.set_policy(stage, parse_policy(stage, raw)?);
        }
    }
    Ok(config)
}

fn parse_policy(stage: Stage, raw: &str) -> Result<FailurePolicy> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "abort" | "abort_pipeline" => Ok(FailurePolicy::AbortPipeline),
        "continue" | "continue_on_error" => Ok(FailurePolicy::ContinueOnError),
        other => bail!(
            "policy.{stage}: unsupported value '{other}' (expected 'abort_pipeline' or 'continue_on_error')"
        ),
    }
}

fn update_package(base: &Path, raw: &UpdateToml) -> Result<UpdatePackage> {
    let path = resolve_path(base, &raw.path);
    let release = raw
        .release
        .parse::<ReleaseId>()
        .map_err(|e| anyhow!("updates '{}': {e}", raw.id))?;
    let class = match raw.class.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "servicing_stack" | "ssu" => UpdateClass::ServicingStack,
        "cumulative" | "lcu" => UpdateClass::Cumulative,
        "optional" => UpdateClass::Optional,
        other => bail!(
            "updates '{}': unsupported class '{other}' (expected servicing_stack, cumulative or optional)",
            raw.id
        ),
    };
    let declared_format = match raw.format.as_deref().map(|f| f.trim().to_ascii_lowercase()) {
        Some(f) if f == "wrapped" || f == "msu" => ContainerFormat::Wrapped,
        Some(f) if f == "bare" || f == "cab" => ContainerFormat::Bare,
        Some(other) => bail!(
            "updates '{}': unsupported format '{other}' (expected wrapped or bare)",
            raw.id
        ),
        None => classify_container(&path)
            .with_context(|| format!("updates '{}': sniffing container format", raw.id))?,
    };
    Ok(UpdatePackage {
        id: raw.id.trim().to_string(),
        declared_format,
        path,
        release,
        class,
        supersedes: raw.supersedes.iter().map(|s| s.trim().to_string()).collect(),
    })
}

fn language_item(base: &Path, raw: &LanguageToml) -> Result<LanguageItem> {
    let required_path = |what: &str| {
        raw.path
            .as_deref()
            .map(|p| resolve_path(base, p))
            .ok_or_else(|| anyhow!("language item of kind '{what}' requires 'path'"))
    };
    match raw.kind.trim().to_ascii_lowercase().as_str() {
        "pack" => Ok(LanguageItem::Pack {
            path: required_path("pack")?,
        }),
        "feature" => Ok(LanguageItem::Feature {
            name: raw
                .name
                .clone()
                .ok_or_else(|| anyhow!("language item of kind 'feature' requires 'name'"))?,
            source: raw.source.as_deref().map(|s| resolve_path(base, s)),
        }),
        "experience" => Ok(LanguageItem::Experience {
            path: required_path("experience")?,
            license: raw.license.as_deref().map(|l| resolve_path(base, l)),
        }),
        other => bail!("unsupported language kind '{other}' (expected pack, feature or experience)"),
    }
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw.trim());
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Bare program names are left for `PATH` lookup.
fn resolve_program(base: &Path, raw: &str) -> PathBuf {
    let raw = raw.trim();
    if raw.contains('/') || raw.contains('\\') {
        resolve_path(base, raw)
    } else {
        PathBuf::from(raw)
    }
}
