//! Signals exchanged with the presentation layer.
//!
//! The orchestrator is single-threaded. An operator influences a run only
//! through the [`CancellationToken`] (checked between stages and inside item
//! loops) and through the answers it returns from [`Operator`] callbacks.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::mount::MountHealth;
use crate::pipeline::Stage;
use crate::report::StageOutcome;

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Where the orchestrator may pause for manual work on the mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPoint {
    AfterMount,
    BeforeCommit,
}

impl fmt::Display for SuspendPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendPoint::AfterMount => write!(f, "after mount"),
            SuspendPoint::BeforeCommit => write!(f, "before commit"),
        }
    }
}

/// Operator answer at a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSignal {
    Resume,
    Cancel,
}

/// Presentation-layer callbacks. Every method has a non-interactive default.
pub trait Operator {
    fn stage_started(&self, _stage: Stage) {}

    fn stage_finished(&self, _outcome: &StageOutcome) {}

    /// Progress inside a stage's item loop (1-based `position`).
    fn item_progress(&self, _stage: Stage, _item: &str, _position: usize, _total: usize) {}

    /// Confirm discarding a stale mount. Declines unless overridden.
    fn confirm_discard(&self, _mount_point: &Path, _health: MountHealth) -> bool {
        false
    }

    /// Block until the operator resumes or cancels.
    fn await_resume(&self, _point: SuspendPoint, _mount_point: &Path) -> ResumeSignal {
        ResumeSignal::Resume
    }
}

/// Operator that accepts every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

impl Operator for Unattended {}
