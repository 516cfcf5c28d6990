use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use super::{fold_items, ItemResult, StageWork};
use crate::context::RunContext;
use crate::control::Operator;
use crate::error::Result;
use crate::mount::MountSession;
use crate::pipeline::Stage;

/// A driver package file or a directory of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSource {
    pub path: PathBuf,
    /// Search subdirectories for `.inf` files.
    pub recurse: bool,
}

pub fn apply_drivers(
    ctx: &RunContext,
    session: &mut MountSession,
    sources: &[DriverSource],
    operator: &dyn Operator,
) -> Result<StageWork> {
    fold_items(
        ctx,
        operator,
        Stage::Drivers,
        sources,
        |s| s.path.display().to_string(),
        |source| {
            if !source.path.exists() {
                return Ok(ItemResult::Failed("driver path does not exist".to_string()));
            }
            if count_inf_files(&source.path, source.recurse) == 0 {
                return Ok(ItemResult::Failed("no .inf driver packages found".to_string()));
            }
            session.mark_dirty()?;
            Ok(
                match ctx
                    .engine()
                    .add_driver(session.mount_point(), &source.path, source.recurse)
                {
                    Ok(installed) => {
                        info!(path = %source.path.display(), installed, "driver packages installed");
                        ItemResult::Done
                    }
                    Err(e) => ItemResult::Failed(e.to_string()),
                },
            )
        },
    )
}

fn is_inf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("inf"))
}

pub(crate) fn count_inf_files(path: &Path, recurse: bool) -> usize {
    if path.is_file() {
        return usize::from(is_inf(path));
    }
    let walker = WalkDir::new(path);
    let walker = if recurse { walker } else { walker.max_depth(1) };
    walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_inf(e.path()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Unattended;
    use crate::engine::fake::FakeEngine;
    use crate::engine::EngineError;
    use crate::mount::{MountManager, MountState};
    use crate::testutil::Fixture;

    #[test]
    fn test_inf_discovery_respects_recurse() {
        let f = Fixture::new(FakeEngine::new());
        f.file("drivers/net/e1000.INF", b"[Version]");
        f.file("drivers/readme.txt", b"");
        let dir = f.root().join("payloads/drivers");
        assert_eq!(count_inf_files(&dir, true), 1);
        assert_eq!(count_inf_files(&dir, false), 0);
        assert_eq!(count_inf_files(&dir.join("net/e1000.INF"), false), 1);
    }

    #[test]
    fn test_bad_sources_fail_items_without_engine_calls() {
        let f = Fixture::new(FakeEngine::new());
        f.file("empty/readme.txt", b"");
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();
        let sources = vec![
            DriverSource {
                path: f.root().join("missing"),
                recurse: true,
            },
            DriverSource {
                path: f.root().join("payloads/empty"),
                recurse: true,
            },
        ];

        let work = apply_drivers(&f.ctx, &mut session, &sources, &Unattended).unwrap();
        assert_eq!(work.failures.len(), 2);
        assert_eq!(f.engine.count("add_driver"), 0);
        assert_eq!(session.state(), MountState::Mounted);
        manager.release(session, false).unwrap();
    }

    #[test]
    fn test_engine_failure_is_an_item_failure() {
        let mut engine = FakeEngine::new();
        engine.driver_error = Some(EngineError::new("add-driver", Some(0x8000_4005), "unsigned"));
        let f = Fixture::new(engine);
        f.file("ok/a.inf", b"");
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();
        let sources = vec![DriverSource {
            path: f.root().join("payloads/ok"),
            recurse: false,
        }];

        let work = apply_drivers(&f.ctx, &mut session, &sources, &Unattended).unwrap();
        assert_eq!(work.failures.len(), 1);
        assert!(work.failures[0].reason.contains("unsigned"));
        assert_eq!(session.state(), MountState::Dirty);
        manager.release(session, false).unwrap();
    }
}
