use serde::Serialize;

use super::{BuildNumber, ReleaseFamily, ReleaseId};
use crate::error::{Result, ServicingError};

/// How a range relates to the release's nominal build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// The release's own build number.
    Exact,
    /// A build number the release also shipped under.
    Variant,
}

/// Half-open `[start, end)` span of builds mapping to one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseRange {
    pub release: ReleaseId,
    pub start: BuildNumber,
    pub end: BuildNumber,
    pub kind: MatchKind,
}

impl ReleaseRange {
    pub fn new(release: ReleaseId, start: BuildNumber, end: BuildNumber, kind: MatchKind) -> Self {
        Self {
            release,
            start,
            end,
            kind,
        }
    }

    /// Every revision of a single build.
    pub fn build(release: ReleaseId, build: u32) -> Self {
        Self::new(
            release,
            BuildNumber::new(build, 0),
            BuildNumber::new(build + 1, 0),
            MatchKind::Exact,
        )
    }

    pub fn contains(&self, number: BuildNumber) -> bool {
        self.start <= number && number < self.end
    }
}

/// Sorted, non-overlapping release ranges.
#[derive(Debug, Clone)]
pub struct ReleaseTable {
    ranges: Vec<ReleaseRange>,
}

impl ReleaseTable {
    /// Validate and sort `ranges`. Empty or overlapping ranges are rejected.
    pub fn new(mut ranges: Vec<ReleaseRange>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(ServicingError::InvalidReleaseTable(
                "table has no ranges".to_string(),
            ));
        }
        for range in &ranges {
            if range.start >= range.end {
                return Err(ServicingError::InvalidReleaseTable(format!(
                    "empty range {}..{} for {}",
                    range.start, range.end, range.release
                )));
            }
        }
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(ServicingError::InvalidReleaseTable(format!(
                    "{} ({}..{}) overlaps {} ({}..{})",
                    pair[0].release,
                    pair[0].start,
                    pair[0].end,
                    pair[1].release,
                    pair[1].start,
                    pair[1].end
                )));
            }
        }
        Ok(Self { ranges })
    }

    /// Built-in table for Windows 10 1809 through Windows 11 24H2.
    pub fn windows() -> Result<Self> {
        let w10 = |label| ReleaseId::new(ReleaseFamily::Windows10, label);
        let w11 = |label| ReleaseId::new(ReleaseFamily::Windows11, label);
        Self::new(vec![
            ReleaseRange::build(w10("1809"), 17763),
            ReleaseRange::build(w10("2004"), 19041),
            ReleaseRange::build(w10("20H2"), 19042),
            ReleaseRange::build(w10("21H1"), 19043),
            ReleaseRange::build(w10("21H2"), 19044),
            ReleaseRange::build(w10("22H2"), 19045),
            ReleaseRange::build(w11("21H2"), 22000),
            ReleaseRange::new(
                w11("22H2"),
                BuildNumber::new(22621, 0),
                BuildNumber::new(22621, 2428),
                MatchKind::Exact,
            ),
            // 23H2 media is frequently stamped with the shared 22621 base.
            ReleaseRange::new(
                w11("23H2"),
                BuildNumber::new(22621, 2428),
                BuildNumber::new(22622, 0),
                MatchKind::Variant,
            ),
            ReleaseRange::build(w11("23H2"), 22631),
            ReleaseRange::build(w11("24H2"), 26100),
        ])
    }

    pub fn ranges(&self) -> &[ReleaseRange] {
        &self.ranges
    }

    /// Lowest supported build; anything below is legacy.
    pub fn legacy_floor(&self) -> BuildNumber {
        self.ranges[0].start
    }

    pub fn matching(&self, number: BuildNumber) -> impl Iterator<Item = &ReleaseRange> {
        self.ranges.iter().filter(move |r| r.contains(number))
    }

    pub fn lookup(&self, number: BuildNumber) -> Option<&ReleaseRange> {
        let idx = self.ranges.partition_point(|r| r.end <= number);
        self.ranges.get(idx).filter(|r| r.contains(number))
    }
}
