//! Update resolver.
//!
//! Turns the catalog's candidate packages into the ordered list for the
//! image's release, and applies each one with a single bounded fallback to the
//! alternate container interpretation.

mod apply;
mod container;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::version::{ReleaseId, VersionClassification};

pub use apply::{apply, apply_all, ApplyResult, PackageOutcome, UpdateRun};
pub use container::classify_container;

/// On-disk packaging of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// Outer container holding one or more payloads (`.msu`).
    Wrapped,
    /// The servicing payload itself (`.cab`).
    Bare,
}

impl ContainerFormat {
    pub fn alternate(self) -> Self {
        match self {
            ContainerFormat::Wrapped => ContainerFormat::Bare,
            ContainerFormat::Bare => ContainerFormat::Wrapped,
        }
    }

    /// Extension the engine keys its interpretation on.
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Wrapped => "msu",
            ContainerFormat::Bare => "cab",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Wrapped => write!(f, "wrapped"),
            ContainerFormat::Bare => write!(f, "bare"),
        }
    }
}

/// Application order class. Variant order is the apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateClass {
    ServicingStack,
    Cumulative,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub id: String,
    pub declared_format: ContainerFormat,
    pub path: PathBuf,
    pub release: ReleaseId,
    pub class: UpdateClass,
    #[serde(default)]
    pub supersedes: BTreeSet<String>,
}

/// Ordered, supersedence-free packages for the classified release.
///
/// Supersedence is evaluated only among packages that target the release: an
/// update for another release never knocks out one for this image.
pub fn resolve_applicable(
    candidates: &[UpdatePackage],
    classification: &VersionClassification,
) -> Result<Vec<UpdatePackage>> {
    let release = classification.require_supported()?;

    let mut seen = HashSet::new();
    let mut pool = Vec::new();
    for candidate in candidates {
        if &candidate.release != release {
            debug!(package = %candidate.id, target = %candidate.release, "skipping package for another release");
            continue;
        }
        if !seen.insert(candidate.id.as_str()) {
            warn!(package = %candidate.id, "duplicate package id; keeping the first entry");
            continue;
        }
        pool.push(candidate);
    }

    let superseded: HashSet<&str> = pool
        .iter()
        .copied()
        .flat_map(|p| {
            p.supersedes
                .iter()
                .map(String::as_str)
                .filter(move |id| *id != p.id)
        })
        .collect();

    let mut ordered: Vec<UpdatePackage> = pool
        .into_iter()
        .filter(|p| {
            let dropped = superseded.contains(p.id.as_str());
            if dropped {
                debug!(package = %p.id, "dropping superseded package");
            }
            !dropped
        })
        .cloned()
        .collect();
    ordered.sort_by_key(|p| p.class);
    Ok(ordered)
}
