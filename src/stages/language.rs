use std::path::PathBuf;

use super::{fold_items, ItemResult, StageWork};
use crate::context::RunContext;
use crate::control::Operator;
use crate::engine::{EngineError, EngineErrorKind};
use crate::error::Result;
use crate::mount::MountSession;
use crate::pipeline::Stage;

/// One language resource to add to the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageItem {
    /// Language pack cabinet.
    Pack { path: PathBuf },
    /// Feature on demand, e.g. `Language.Basic~~~de-DE~0.0.1.0`.
    Feature { name: String, source: Option<PathBuf> },
    /// Local experience pack (provisioned app package).
    Experience {
        path: PathBuf,
        license: Option<PathBuf>,
    },
}

impl LanguageItem {
    pub fn label(&self) -> String {
        match self {
            LanguageItem::Pack { path } | LanguageItem::Experience { path, .. } => {
                path.display().to_string()
            }
            LanguageItem::Feature { name, .. } => name.clone(),
        }
    }
}

pub fn apply_language(
    ctx: &RunContext,
    session: &mut MountSession,
    items: &[LanguageItem],
    operator: &dyn Operator,
) -> Result<StageWork> {
    fold_items(ctx, operator, Stage::LanguageResources, items, LanguageItem::label, |item| {
        let missing = match item {
            LanguageItem::Pack { path } | LanguageItem::Experience { path, .. } => {
                (!path.is_file()).then(|| path.clone())
            }
            LanguageItem::Feature { source, .. } => source.clone().filter(|s| !s.exists()),
        };
        if let Some(path) = missing {
            return Ok(ItemResult::Failed(format!(
                "'{}' does not exist",
                path.display()
            )));
        }

        session.mark_dirty()?;
        let mount_point = session.mount_point();
        let engine = ctx.engine();
        let applied = match item {
            LanguageItem::Pack { path } => engine.add_package(mount_point, path),
            LanguageItem::Feature { name, source } => {
                engine.add_capability(mount_point, name, source.as_deref())
            }
            LanguageItem::Experience { path, license } => {
                engine.add_provisioned_appx(mount_point, path, license.as_deref())
            }
        };
        Ok(item_result(applied))
    })
}

fn item_result(applied: std::result::Result<(), EngineError>) -> ItemResult {
    match applied {
        Ok(()) => ItemResult::Done,
        Err(e) if e.kind == EngineErrorKind::NotApplicable => {
            ItemResult::Note(format!("not applicable to this image: {e}"))
        }
        Err(e) => ItemResult::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Unattended;
    use crate::engine::fake::FakeEngine;
    use crate::mount::MountManager;
    use crate::testutil::Fixture;

    #[test]
    fn test_each_kind_uses_its_primitive() {
        let f = Fixture::new(FakeEngine::new());
        let pack = f.file("de-de/lp.cab", b"MSCF");
        let lxp = f.file("de-de/LanguageExperiencePack.de-DE.Neutral.appx", b"PK");
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();
        let items = vec![
            LanguageItem::Pack { path: pack },
            LanguageItem::Feature {
                name: "Language.Basic~~~de-DE~0.0.1.0".to_string(),
                source: None,
            },
            LanguageItem::Experience {
                path: lxp,
                license: None,
            },
        ];

        let work = apply_language(&f.ctx, &mut session, &items, &Unattended).unwrap();
        assert!(work.failures.is_empty());
        assert_eq!(f.engine.count("add_package"), 1);
        assert_eq!(f.engine.count("add_capability"), 1);
        assert_eq!(f.engine.count("add_appx"), 1);
        manager.release(session, false).unwrap();
    }

    #[test]
    fn test_missing_inputs_fail_and_not_applicable_is_a_note() {
        let engine = FakeEngine::new().with_package_rule(|_| {
            Err(EngineError::new("add-package", Some(0x800F_081E), "not applicable"))
        });
        let f = Fixture::new(engine);
        let pack = f.file("fr-fr/lp.cab", b"MSCF");
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();
        let items = vec![
            LanguageItem::Pack { path: pack },
            LanguageItem::Feature {
                name: "Language.Speech~~~fr-FR~0.0.1.0".to_string(),
                source: Some(f.root().join("no-such-fod-source")),
            },
        ];

        let work = apply_language(&f.ctx, &mut session, &items, &Unattended).unwrap();
        assert_eq!(work.notes.len(), 1);
        assert_eq!(work.failures.len(), 1);
        assert_eq!(work.failures[0].item, "Language.Speech~~~fr-FR~0.0.1.0");
        assert_eq!(f.engine.count("add_capability"), 0);
        manager.release(session, false).unwrap();
    }
}
