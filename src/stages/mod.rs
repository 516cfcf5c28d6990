//! Customization appliers run between mount and commit.
//!
//! Each applier walks its configured items in order and returns a
//! [`StageWork`]: item failures and notes are values, never early returns.
//! The orchestrator turns that into a stage outcome according to the stage's
//! failure policy.

pub mod drivers;
pub mod hooks;
pub mod language;
pub mod registry;
pub mod removal;

use tracing::{info, warn};

use crate::context::RunContext;
use crate::control::Operator;
use crate::error::Result;
use crate::pipeline::Stage;
use crate::report::ItemFailure;

pub use drivers::{apply_drivers, DriverSource};
pub use hooks::{run_hooks, ScriptHook};
pub use language::{apply_language, LanguageItem};
pub use registry::{apply_registry, rewrite_reg_keys, OfflineHive, RegistryImport};
pub use removal::remove_provisioned;

/// Accumulated result of one stage's item loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageWork {
    pub failures: Vec<ItemFailure>,
    pub notes: Vec<String>,
    /// The loop stopped early because the run was cancelled.
    pub cancelled: bool,
}

impl StageWork {
    pub fn fail(&mut self, item: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(ItemFailure::new(item, reason));
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

/// Result of applying a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemResult {
    Done,
    /// Nothing went wrong, but the operator should see this.
    Note(String),
    Failed(String),
}

/// Fold `apply` over `items`, checking cancellation before each one.
///
/// `Err` from `apply` aborts the loop; it is reserved for losing the mount
/// session record.
pub(crate) fn fold_items<T>(
    ctx: &RunContext,
    operator: &dyn Operator,
    stage: Stage,
    items: &[T],
    label: impl Fn(&T) -> String,
    mut apply: impl FnMut(&T) -> Result<ItemResult>,
) -> Result<StageWork> {
    let mut work = StageWork::default();
    for (position, item) in items.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            warn!(%stage, remaining = items.len() - position, "cancellation requested; stopping item loop");
            work.cancelled = true;
            break;
        }
        let name = label(item);
        operator.item_progress(stage, &name, position + 1, items.len());
        match apply(item)? {
            ItemResult::Done => info!(%stage, item = %name, "item applied"),
            ItemResult::Note(note) => {
                info!(%stage, item = %name, %note, "item skipped");
                work.note(note);
            }
            ItemResult::Failed(reason) => {
                warn!(%stage, item = %name, %reason, "item failed");
                work.fail(name, reason);
            }
        }
    }
    Ok(work)
}
