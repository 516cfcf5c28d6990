use std::collections::HashSet;

use tracing::info;

use super::{fold_items, ItemResult, StageWork};
use crate::context::RunContext;
use crate::control::Operator;
use crate::error::Result;
use crate::mount::MountSession;
use crate::pipeline::Stage;

/// Remove provisioned app packages whose display name starts with one of
/// `prefixes` (case-insensitive). A prefix that matches nothing is a note.
pub fn remove_provisioned(
    ctx: &RunContext,
    session: &mut MountSession,
    prefixes: &[String],
    operator: &dyn Operator,
) -> Result<StageWork> {
    if prefixes.is_empty() {
        return Ok(StageWork::default());
    }

    let installed = match ctx.engine().provisioned_appx(session.mount_point()) {
        Ok(list) => list,
        Err(e) => {
            let mut work = StageWork::default();
            work.fail("provisioned package list", e.to_string());
            return Ok(work);
        }
    };

    // Overlapping prefixes select a package once.
    let mut selected: HashSet<&str> = HashSet::new();
    fold_items(ctx, operator, Stage::PackageRemoval, prefixes, String::clone, |prefix| {
        let wanted = prefix.to_ascii_lowercase();
        let matches: Vec<_> = installed
            .iter()
            .filter(|p| p.display_name.to_ascii_lowercase().starts_with(&wanted))
            .collect();
        if matches.is_empty() {
            return Ok(ItemResult::Note(format!(
                "no provisioned package matches '{prefix}'"
            )));
        }
        let fresh: Vec<_> = matches
            .into_iter()
            .filter(|p| selected.insert(p.package_name.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(ItemResult::Note(format!(
                "packages matching '{prefix}' were already removed by an earlier prefix"
            )));
        }

        session.mark_dirty()?;
        let mut errors = Vec::new();
        for package in fresh {
            match ctx
                .engine()
                .remove_provisioned_appx(session.mount_point(), &package.package_name)
            {
                Ok(()) => info!(package = %package.package_name, "provisioned package removed"),
                Err(e) => errors.push(format!("{}: {e}", package.package_name)),
            }
        }
        Ok(if errors.is_empty() {
            ItemResult::Done
        } else {
            ItemResult::Failed(errors.join("; "))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Unattended;
    use crate::engine::fake::FakeEngine;
    use crate::engine::ProvisionedAppx;
    use crate::mount::MountManager;
    use crate::testutil::Fixture;

    fn appx(display: &str, package: &str) -> ProvisionedAppx {
        ProvisionedAppx {
            display_name: display.to_string(),
            package_name: package.to_string(),
        }
    }

    #[test]
    fn test_prefix_matching_removes_every_match() {
        let mut engine = FakeEngine::new();
        engine.appx = vec![
            appx("Microsoft.BingNews", "Microsoft.BingNews_4.1.0_x64__8wekyb3d8bbwe"),
            appx("Microsoft.BingWeather", "Microsoft.BingWeather_4.53.0_x64__8wekyb3d8bbwe"),
            appx("Microsoft.WindowsCalculator", "Microsoft.WindowsCalculator_11.0_x64__8wekyb3d8bbwe"),
        ];
        let f = Fixture::new(engine);
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();

        let prefixes = vec!["microsoft.bing".to_string(), "Clipchamp".to_string()];
        let work = remove_provisioned(&f.ctx, &mut session, &prefixes, &Unattended).unwrap();
        assert!(work.failures.is_empty());
        assert_eq!(work.notes, vec!["no provisioned package matches 'Clipchamp'".to_string()]);
        assert_eq!(f.engine.count("remove_appx"), 2);
        assert_eq!(f.engine.count("remove_appx Microsoft.WindowsCalculator"), 0);
        manager.release(session, false).unwrap();
    }

    #[test]
    fn test_overlapping_prefixes_remove_each_package_once() {
        let mut engine = FakeEngine::new();
        engine.appx = vec![
            appx("Microsoft.BingNews", "Microsoft.BingNews_4.1.0_x64__8wekyb3d8bbwe"),
            appx("Microsoft.BingWeather", "Microsoft.BingWeather_4.53.0_x64__8wekyb3d8bbwe"),
        ];
        let f = Fixture::new(engine);
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();

        let prefixes = vec![
            "Microsoft.Bing".to_string(),
            "Microsoft.BingNews".to_string(),
        ];
        let work = remove_provisioned(&f.ctx, &mut session, &prefixes, &Unattended).unwrap();
        assert!(work.failures.is_empty());
        assert_eq!(f.engine.count("remove_appx Microsoft.BingNews"), 1);
        assert_eq!(f.engine.count("remove_appx"), 2);
        assert_eq!(work.notes.len(), 1);
        assert!(work.notes[0].contains("already removed"));
        manager.release(session, false).unwrap();
    }
}
