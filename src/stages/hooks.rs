use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use super::{fold_items, ItemResult, StageWork};
use crate::context::RunContext;
use crate::control::Operator;
use crate::error::Result;
use crate::mount::MountSession;
use crate::pipeline::Stage;
use crate::version::ReleaseId;

pub const ENV_MOUNT_PATH: &str = "SERVICER_MOUNT_PATH";
pub const ENV_IMAGE_PATH: &str = "SERVICER_IMAGE_PATH";
pub const ENV_IMAGE_INDEX: &str = "SERVICER_IMAGE_INDEX";
pub const ENV_RELEASE: &str = "SERVICER_RELEASE";

/// External program run against the mounted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHook {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

pub fn run_hooks(
    ctx: &RunContext,
    session: &mut MountSession,
    hooks: &[ScriptHook],
    release: Option<&ReleaseId>,
    operator: &dyn Operator,
) -> Result<StageWork> {
    let release = release.map(ToString::to_string).unwrap_or_default();
    fold_items(ctx, operator, Stage::ScriptHooks, hooks, |h| h.name.clone(), |hook| {
        session.mark_dirty()?;
        let mut command = Command::new(&hook.program);
        command
            .args(&hook.args)
            .env(ENV_MOUNT_PATH, session.mount_point())
            .env(ENV_IMAGE_PATH, session.image())
            .env(ENV_IMAGE_INDEX, session.index().to_string())
            .env(ENV_RELEASE, &release);
        if let Some(dir) = &hook.working_dir {
            command.current_dir(dir);
        }

        let output = match command.output() {
            Ok(output) => output,
            Err(e) => {
                return Ok(ItemResult::Failed(format!(
                    "could not start '{}': {e}",
                    hook.program.display()
                )))
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(hook = %hook.name, stdout = %stdout.trim(), "hook finished");

        if output.status.success() {
            return Ok(ItemResult::Done);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(ItemResult::Failed(format!(
            "exited with {}: {}",
            output.status,
            tail(&stderr, 400)
        )))
    })
}

/// Last `max` bytes of `text`, trimmed, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let text = text.trim();
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
