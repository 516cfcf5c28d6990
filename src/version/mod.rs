//! Build-number → release classification.
//!
//! Vendor media for one nominal release has shipped under several build
//! numbers (23H2 images reporting `22621.x` are the common case), so matching
//! is range based. A single [`ReleaseTable`] is the only place these ranges
//! live; its constructor rejects overlapping ranges so no build can resolve to
//! two releases.

mod table;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

pub use table::{MatchKind, ReleaseRange, ReleaseTable};

/// `build.revision` portion of a `10.0.build.revision` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildNumber {
    pub build: u32,
    pub revision: u32,
}

impl BuildNumber {
    pub const fn new(build: u32, revision: u32) -> Self {
        Self { build, revision }
    }
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.build, self.revision)
    }
}

/// Fully parsed dotted build identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuild {
    pub major: u32,
    pub minor: u32,
    pub number: BuildNumber,
}

impl RawBuild {
    /// Parse `major.minor.build[.revision]`; a missing revision reads as 0.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<u32> = raw
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        match parts.as_slice() {
            [major, minor, build] => Some(Self {
                major: *major,
                minor: *minor,
                number: BuildNumber::new(*build, 0),
            }),
            [major, minor, build, revision] => Some(Self {
                major: *major,
                minor: *minor,
                number: BuildNumber::new(*build, *revision),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseFamily {
    Windows10,
    Windows11,
}

impl fmt::Display for ReleaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseFamily::Windows10 => write!(f, "Windows 10"),
            ReleaseFamily::Windows11 => write!(f, "Windows 11"),
        }
    }
}

/// A supported release, e.g. `Windows 11 23H2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseId {
    pub family: ReleaseFamily,
    pub label: String,
}

impl ReleaseId {
    pub fn new(family: ReleaseFamily, label: &str) -> Self {
        Self {
            family,
            label: label.to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.label)
    }
}

impl FromStr for ReleaseId {
    type Err = String;

    /// Accepts `Windows 11 23H2`, `windows11 23h2`, `win11-23H2` and similar.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let (family, label) = if let Some(rest) = compact
            .strip_prefix("windows11")
            .or_else(|| compact.strip_prefix("win11"))
        {
            (ReleaseFamily::Windows11, rest)
        } else if let Some(rest) = compact
            .strip_prefix("windows10")
            .or_else(|| compact.strip_prefix("win10"))
        {
            (ReleaseFamily::Windows10, rest)
        } else {
            return Err(format!("unknown release family in '{s}'"));
        };
        if label.is_empty() {
            return Err(format!("missing release label in '{s}'"));
        }
        Ok(ReleaseId::new(family, label))
    }
}

/// Why a build is not serviceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedReason {
    /// Older than every supported release.
    Legacy,
    /// Well-formed but not in any known range.
    Unrecognized,
    /// Not a dotted numeric build identifier.
    Malformed,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedReason::Legacy => write!(
                f,
                "build predates every supported release; use a previous version of this tool"
            ),
            UnsupportedReason::Unrecognized => write!(
                f,
                "build is not a recognized release; verify the source media"
            ),
            UnsupportedReason::Malformed => write!(
                f,
                "build identifier is not in major.minor.build[.revision] form"
            ),
        }
    }
}

/// Result of classifying one raw build string. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionClassification {
    pub raw: String,
    pub release: Option<ReleaseId>,
    /// True when a variant range rather than an exact build matched.
    pub ambiguous: bool,
    pub supported: bool,
    pub unsupported: Option<UnsupportedReason>,
}

impl VersionClassification {
    fn unsupported(raw: &str, reason: UnsupportedReason) -> Self {
        Self {
            raw: raw.to_string(),
            release: None,
            ambiguous: false,
            supported: false,
            unsupported: Some(reason),
        }
    }

    /// Informational note a caller must surface for ambiguous matches.
    pub fn ambiguity_note(&self) -> Option<String> {
        match (&self.release, self.ambiguous) {
            (Some(release), true) => Some(format!(
                "build {} is not an exact match for any release; assuming {}",
                self.raw, release
            )),
            _ => None,
        }
    }

    /// Turn an unsupported classification into the hard-stop error.
    pub fn require_supported(&self) -> Result<&ReleaseId> {
        match (&self.release, self.supported) {
            (Some(release), true) => Ok(release),
            _ => Err(crate::ServicingError::UnsupportedVersion {
                raw: self.raw.clone(),
                reason: self
                    .unsupported
                    .unwrap_or(UnsupportedReason::Unrecognized)
                    .to_string(),
            }),
        }
    }
}

/// Classifier over a validated release table.
#[derive(Debug, Clone)]
pub struct VersionClassifier {
    table: ReleaseTable,
}

impl VersionClassifier {
    pub fn new(table: ReleaseTable) -> Self {
        Self { table }
    }

    /// Classifier over the built-in Windows 10/11 table.
    pub fn windows() -> Result<Self> {
        Ok(Self::new(ReleaseTable::windows()?))
    }

    pub fn table(&self) -> &ReleaseTable {
        &self.table
    }

    pub fn classify(&self, raw: &str) -> VersionClassification {
        let Some(parsed) = RawBuild::parse(raw) else {
            return VersionClassification::unsupported(raw, UnsupportedReason::Malformed);
        };

        if parsed.major < 10 {
            return VersionClassification::unsupported(raw, UnsupportedReason::Legacy);
        }
        if parsed.major != 10 || parsed.minor != 0 {
            return VersionClassification::unsupported(raw, UnsupportedReason::Unrecognized);
        }

        match self.table.lookup(parsed.number) {
            Some(range) => {
                let classification = VersionClassification {
                    raw: raw.trim().to_string(),
                    release: Some(range.release.clone()),
                    ambiguous: range.kind == MatchKind::Variant,
                    supported: true,
                    unsupported: None,
                };
                if let Some(note) = classification.ambiguity_note() {
                    info!(raw = %classification.raw, release = %range.release, "{note}");
                }
                classification
            }
            None if parsed.number < self.table.legacy_floor() => {
                VersionClassification::unsupported(raw, UnsupportedReason::Legacy)
            }
            None => VersionClassification::unsupported(raw, UnsupportedReason::Unrecognized),
        }
    }
}
