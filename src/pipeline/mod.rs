//! Stage sequencing for one servicing run.
//!
//! ```text
//! Validate → Mount → Drivers → Updates → LanguageResources → PackageRemoval
//!          → RegistryPolicy → ScriptHooks → Commit → Export
//! ```
//!
//! [`StageConfig`] says which stages run and how they react to failure;
//! [`ServicingPlan`] says what each stage applies. Both are plain values
//! produced by the configuration layer.

mod orchestrator;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stages::{DriverSource, LanguageItem, RegistryImport, ScriptHook};
use crate::updates::UpdatePackage;

pub use orchestrator::Orchestrator;

/// Pipeline stages. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Mount,
    Drivers,
    Updates,
    LanguageResources,
    PackageRemoval,
    RegistryPolicy,
    ScriptHooks,
    Commit,
    Export,
}

impl Stage {
    pub const ORDER: [Stage; 10] = [
        Stage::Validate,
        Stage::Mount,
        Stage::Drivers,
        Stage::Updates,
        Stage::LanguageResources,
        Stage::PackageRemoval,
        Stage::RegistryPolicy,
        Stage::ScriptHooks,
        Stage::Commit,
        Stage::Export,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Mount => "mount",
            Stage::Drivers => "drivers",
            Stage::Updates => "updates",
            Stage::LanguageResources => "language_resources",
            Stage::PackageRemoval => "package_removal",
            Stage::RegistryPolicy => "registry_policy",
            Stage::ScriptHooks => "script_hooks",
            Stage::Commit => "commit",
            Stage::Export => "export",
        }
    }

    /// Stages that modify the mounted image.
    pub fn needs_session(self) -> bool {
        matches!(
            self,
            Stage::Drivers
                | Stage::Updates
                | Stage::LanguageResources
                | Stage::PackageRemoval
                | Stage::RegistryPolicy
                | Stage::ScriptHooks
                | Stage::Commit
        )
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        let wanted = name.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ORDER.into_iter().find(|s| s.as_str() == wanted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failing stage does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record `FatalFailure`, skip everything after, discard the mount.
    AbortPipeline,
    /// Record `PartialFailure` and continue.
    ContinueOnError,
}

impl FailurePolicy {
    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Validate | Stage::Mount | Stage::Commit | Stage::Export => {
                FailurePolicy::AbortPipeline
            }
            _ => FailurePolicy::ContinueOnError,
        }
    }
}

/// Per-run stage switches. `Validate` can be neither disabled nor relaxed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConfig {
    pub(crate) disabled: BTreeSet<Stage>,
    pub(crate) policies: BTreeMap<Stage, FailurePolicy>,
    pub pause_after_mount: bool,
    pub pause_before_commit: bool,
    /// Discard stale mounts found at startup without asking.
    pub auto_fix: bool,
}

impl StageConfig {
    pub fn is_enabled(&self, stage: Stage) -> bool {
        stage == Stage::Validate || !self.disabled.contains(&stage)
    }

    pub fn set_enabled(&mut self, stage: Stage, enabled: bool) -> &mut Self {
        if enabled {
            self.disabled.remove(&stage);
        } else {
            self.disabled.insert(stage);
        }
        self
    }

    pub fn policy(&self, stage: Stage) -> FailurePolicy {
        if stage == Stage::Validate {
            return FailurePolicy::AbortPipeline;
        }
        self.policies
            .get(&stage)
            .copied()
            .unwrap_or_else(|| FailurePolicy::default_for(stage))
    }

    pub fn set_policy(&mut self, stage: Stage, policy: FailurePolicy) -> &mut Self {
        self.policies.insert(stage, policy);
        self
    }
}

/// Where and under what name the serviced image is exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub destination: PathBuf,
    pub name: Option<String>,
}

/// Everything a run applies, per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicingPlan {
    pub drivers: Vec<DriverSource>,
    /// Catalog candidates; filtered and ordered at the start of the stage.
    pub updates: Vec<UpdatePackage>,
    pub language: Vec<LanguageItem>,
    /// Display-name prefixes of provisioned apps to remove.
    pub removals: Vec<String>,
    pub registry: Vec<RegistryImport>,
    pub hooks: Vec<ScriptHook>,
    pub export: Option<ExportTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_declaration() {
        let mut sorted = Stage::ORDER;
        sorted.sort();
        assert_eq!(sorted, Stage::ORDER);
        assert_eq!(Stage::ORDER.first(), Some(&Stage::Validate));
        assert_eq!(Stage::ORDER.last(), Some(&Stage::Export));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::from_name("Language-Resources"), Some(Stage::LanguageResources));
        assert_eq!(Stage::from_name("commit"), Some(Stage::Commit));
        assert_eq!(Stage::from_name("nope"), None);
        assert_eq!(Stage::ScriptHooks.to_string(), "script_hooks");
    }

    #[test]
    fn test_default_policies() {
        let config = StageConfig::default();
        assert_eq!(config.policy(Stage::Mount), FailurePolicy::AbortPipeline);
        assert_eq!(config.policy(Stage::Commit), FailurePolicy::AbortPipeline);
        assert_eq!(config.policy(Stage::Updates), FailurePolicy::ContinueOnError);
        assert_eq!(config.policy(Stage::ScriptHooks), FailurePolicy::ContinueOnError);
    }

    #[test]
    fn test_validate_cannot_be_disabled_or_relaxed() {
        let mut config = StageConfig::default();
        config
            .set_enabled(Stage::Validate, false)
            .set_policy(Stage::Validate, FailurePolicy::ContinueOnError)
            .set_enabled(Stage::Drivers, false);
        assert!(config.is_enabled(Stage::Validate));
        assert_eq!(config.policy(Stage::Validate), FailurePolicy::AbortPipeline);
        assert!(!config.is_enabled(Stage::Drivers));
    }
}
