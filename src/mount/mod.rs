//! Mount lifecycle manager.
//!
//! Owns the exclusive "mounted image" resource of a working directory:
//!
//! - [`MountManager::inspect`] / [`MountManager::repair`] run before anything
//!   else and clear mounts left behind by a crashed run
//! - [`MountManager::acquire`] takes the working-directory lock, writes the
//!   session record and mounts the image
//! - [`MountManager::release`] commits or discards and consumes the session,
//!   so a session can be released at most once
//!
//! A [`MountSession`] dropped without release discards its changes.

mod lock;
pub mod record;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::RunContext;
use crate::control::Operator;
use crate::engine::{ImageEngine, MountStatus};
use crate::error::{Result, ServicingError};
use crate::timestamp::now_utc_compact;

use lock::MountLock;
use record::StoredRecord;
pub use record::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounted,
    /// Mounted and modified by at least one stage.
    Dirty,
    Corrupt,
}

/// Result of startup inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountHealth {
    /// No claim on the mount point.
    Clean,
    /// A claim with no live owner, or whose mount point is gone or empty.
    Orphaned,
    /// Accessible but failing the engine's integrity check.
    Corrupt,
}

impl fmt::Display for MountHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountHealth::Clean => write!(f, "clean"),
            MountHealth::Orphaned => write!(f, "orphaned"),
            MountHealth::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// One exclusive binding of an image index to a mount point.
pub struct MountSession {
    engine: Arc<dyn ImageEngine>,
    image: PathBuf,
    index: u32,
    mount_point: PathBuf,
    state: MountState,
    acquired_at_utc: String,
    record_path: PathBuf,
    lock: Option<MountLock>,
    released: bool,
}

impl fmt::Debug for MountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSession")
            .field("image", &self.image)
            .field("index", &self.index)
            .field("mount_point", &self.mount_point)
            .field("state", &self.state)
            .field("acquired_at_utc", &self.acquired_at_utc)
            .finish()
    }
}

impl MountSession {
    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn acquired_at_utc(&self) -> &str {
        &self.acquired_at_utc
    }

    /// Record that a stage wrote to the image.
    pub fn mark_dirty(&mut self) -> Result<()> {
        if self.state == MountState::Dirty {
            return Ok(());
        }
        self.state = MountState::Dirty;
        record::write(&self.record_path, &self.record())
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            image: self.image.clone(),
            index: self.index,
            mount_point: self.mount_point.clone(),
            state: self.state,
            acquired_at_utc: self.acquired_at_utc.clone(),
            owner_pid: std::process::id(),
        }
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            mount_point = %self.mount_point.display(),
            "mount session dropped without release; discarding changes"
        );
        match self.engine.unmount(&self.mount_point, false) {
            Ok(()) => {
                let _ = record::remove(&self.record_path);
            }
            Err(e) => warn!(error = %e, "discard on drop failed; startup repair will be required"),
        }
    }
}

/// Operations on the mount resource of one [`RunContext`].
pub struct MountManager<'a> {
    ctx: &'a RunContext,
}

impl<'a> MountManager<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Bind the context's image index to its mount point.
    pub fn acquire(&self) -> Result<MountSession> {
        let ctx = self.ctx;
        let lock = MountLock::try_acquire(&ctx.lock_path())?.ok_or_else(|| self.busy())?;

        match record::read(&ctx.record_path())? {
            StoredRecord::Intact(existing)
                if matches!(existing.state, MountState::Mounted | MountState::Dirty) =>
            {
                warn!(
                    mount_point = %existing.mount_point.display(),
                    "session record claims a live mount; run repair first"
                );
                return Err(self.busy());
            }
            StoredRecord::Damaged(e) => {
                warn!(error = %e, "session record is unreadable; run repair first");
                return Err(self.busy());
            }
            _ => {}
        }

        let mount_failed = |diagnostic: String| ServicingError::MountFailed {
            image: ctx.image.clone(),
            index: ctx.index,
            mount_point: ctx.mount_point.clone(),
            diagnostic,
        };

        if !ctx.image.is_file() {
            return Err(mount_failed(format!(
                "image file '{}' not found",
                ctx.image.display()
            )));
        }
        if dir_has_entries(&ctx.mount_point) {
            return Err(mount_failed(format!(
                "mount point '{}' is not empty",
                ctx.mount_point.display()
            )));
        }

        ctx.engine()
            .mount(&ctx.image, ctx.index, &ctx.mount_point)
            .map_err(|e| mount_failed(e.to_string()))?;

        let session = MountSession {
            engine: Arc::clone(&ctx.engine),
            image: ctx.image.clone(),
            index: ctx.index,
            mount_point: ctx.mount_point.clone(),
            state: MountState::Mounted,
            acquired_at_utc: now_utc_compact(),
            record_path: ctx.record_path(),
            lock: Some(lock),
            released: false,
        };
        // A session that fails to persist its record is discarded by Drop.
        record::write(&session.record_path, &session.record())?;

        info!(
            image = %session.image.display(),
            index = session.index,
            mount_point = %session.mount_point.display(),
            "image mounted"
        );
        Ok(session)
    }

    /// Classify any existing claim on the mount point.
    ///
    /// Fails with `ResourceBusy` while a live session holds the lock.
    pub fn inspect(&self) -> Result<MountHealth> {
        let ctx = self.ctx;
        let _lock = MountLock::try_acquire(&ctx.lock_path())?.ok_or_else(|| self.busy())?;

        let record = match record::read(&ctx.record_path())? {
            StoredRecord::Absent => None,
            StoredRecord::Intact(record) => Some(record),
            StoredRecord::Damaged(e) => {
                warn!(error = %e, "session record is unreadable; treating the mount as corrupt");
                return Ok(MountHealth::Corrupt);
            }
        };
        let claim = ctx
            .engine()
            .mounted_images()?
            .into_iter()
            .find(|m| same_path(&m.mount_dir, &ctx.mount_point));

        if record.is_none() && claim.is_none() {
            return Ok(MountHealth::Clean);
        }

        if !dir_has_entries(&ctx.mount_point) {
            return Ok(MountHealth::Orphaned);
        }

        let engine_says_bad = claim
            .as_ref()
            .is_some_and(|m| m.status != MountStatus::Ok);
        let record_says_bad = record
            .as_ref()
            .is_some_and(|r| r.state == MountState::Corrupt);
        if engine_says_bad || record_says_bad {
            return Ok(MountHealth::Corrupt);
        }

        if let Err(e) = ctx.engine().check_health(&ctx.mount_point) {
            warn!(error = %e, "integrity check failed on stale mount");
            return Ok(MountHealth::Corrupt);
        }

        // Intact, but nobody owns it and its pending writes are unknown.
        Ok(MountHealth::Orphaned)
    }

    /// Discard any stale claim and leave the mount point unmounted.
    ///
    /// Without `auto_fix` the operator must confirm the discard.
    pub fn repair(&self, auto_fix: bool, operator: &dyn Operator) -> Result<MountState> {
        let ctx = self.ctx;
        let health = self.inspect()?;
        if health == MountHealth::Clean {
            return Ok(MountState::Unmounted);
        }

        if !auto_fix && !operator.confirm_discard(&ctx.mount_point, health) {
            return Err(ServicingError::RepairDeclined {
                mount_point: ctx.mount_point.clone(),
            });
        }

        let _lock = MountLock::try_acquire(&ctx.lock_path())?.ok_or_else(|| self.busy())?;
        info!(mount_point = %ctx.mount_point.display(), %health, "discarding stale mount");

        let engine = ctx.engine();
        let claimed = |engine: &dyn ImageEngine| -> Result<bool> {
            Ok(engine
                .mounted_images()?
                .iter()
                .any(|m| same_path(&m.mount_dir, &ctx.mount_point)))
        };

        if claimed(engine)? {
            if let Err(e) = engine.unmount(&ctx.mount_point, false) {
                warn!(error = %e, "discard of stale mount failed; falling back to cleanup");
            }
        }
        if let Err(e) = engine.cleanup_mounts() {
            warn!(error = %e, "engine mount cleanup reported an error");
        }
        if claimed(engine)? {
            return Err(ServicingError::ReleaseFailed {
                mount_point: ctx.mount_point.clone(),
                diagnostic: "engine still reports the mount after discard and cleanup"
                    .to_string(),
            });
        }

        record::remove(&ctx.record_path())?;
        if ctx.mount_point.exists() {
            fs::remove_dir_all(&ctx.mount_point)
                .map_err(|e| ServicingError::io(&ctx.mount_point, e))?;
        }
        fs::create_dir_all(&ctx.mount_point)
            .map_err(|e| ServicingError::io(&ctx.mount_point, e))?;

        Ok(MountState::Unmounted)
    }

    /// Commit or discard, unmount, and end the session.
    ///
    /// A failed commit still attempts a discard so the mount point is not left
    /// mounted; the commit failure is reported either way.
    pub fn release(&self, mut session: MountSession, commit: bool) -> Result<MountState> {
        session.released = true;
        let engine = Arc::clone(&session.engine);
        let mount_point = session.mount_point.clone();

        let outcome = match engine.unmount(&mount_point, commit) {
            Ok(()) => Ok(()),
            Err(commit_err) if commit => {
                warn!(error = %commit_err, "commit failed; discarding instead");
                match engine.unmount(&mount_point, false) {
                    Ok(()) => Err((commit_err.to_string(), true)),
                    Err(discard_err) => {
                        Err((format!("{commit_err}; discard also failed: {discard_err}"), false))
                    }
                }
            }
            Err(e) => Err((e.to_string(), false)),
        };

        match outcome {
            Ok(()) => {
                record::remove(&session.record_path)?;
                info!(mount_point = %mount_point.display(), commit, "mount released");
                session.state = MountState::Unmounted;
                Ok(MountState::Unmounted)
            }
            Err((diagnostic, unmounted)) => {
                if unmounted {
                    record::remove(&session.record_path)?;
                    session.state = MountState::Unmounted;
                } else {
                    session.state = MountState::Corrupt;
                    record::write(&session.record_path, &session.record())?;
                }
                Err(ServicingError::ReleaseFailed {
                    mount_point,
                    diagnostic,
                })
            }
        }
        // `session` drops here, releasing the working-directory lock.
    }

    fn busy(&self) -> ServicingError {
        ServicingError::ResourceBusy {
            working_dir: self.ctx.working_dir.clone(),
        }
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Compare mount paths the way the engine does: resolved, case-insensitive.
fn same_path(a: &Path, b: &Path) -> bool {
    if let (Ok(a), Ok(b)) = (fs::canonicalize(a), fs::canonicalize(b)) {
        return a == b;
    }
    let norm = |p: &Path| {
        p.to_string_lossy()
            .replace('\\', "/")
            .trim_end_matches('/')
            .to_ascii_lowercase()
    };
    norm(a) == norm(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Unattended;
    use crate::engine::fake::FakeEngine;
    use crate::engine::EngineError;
    use crate::testutil::Fixture;

    fn fixture(engine: FakeEngine) -> Fixture {
        Fixture::new(engine)
    }

    struct Confirming(bool);

    impl Operator for Confirming {
        fn confirm_discard(&self, _mount_point: &Path, _health: MountHealth) -> bool {
            self.0
        }
    }

    #[test]
    fn test_acquire_and_release_commit() {
        let f = fixture(FakeEngine::new());
        let manager = MountManager::new(&f.ctx);

        let mut session = manager.acquire().unwrap();
        assert_eq!(session.state(), MountState::Mounted);
        assert!(f.ctx.record_path().is_file());

        session.mark_dirty().unwrap();
        let rec = record::load(&f.ctx.record_path()).unwrap().unwrap();
        assert_eq!(rec.state, MountState::Dirty);

        assert_eq!(manager.release(session, true).unwrap(), MountState::Unmounted);
        assert!(!f.ctx.record_path().exists());
        assert!(!f.engine.is_mounted(&f.ctx.mount_point));
        assert_eq!(f.engine.count("unmount"), 1);
        assert_eq!(
            f.engine.calls().last().unwrap(),
            &format!("unmount {} commit", f.ctx.mount_point.display())
        );
    }

    #[test]
    fn test_second_acquire_is_resource_busy() {
        let f = fixture(FakeEngine::new());
        let manager = MountManager::new(&f.ctx);

        let session = manager.acquire().unwrap();
        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, ServicingError::ResourceBusy { .. }));
        assert_eq!(f.engine.count("mount"), 1);

        manager.release(session, false).unwrap();
        let again = manager.acquire().unwrap();
        manager.release(again, false).unwrap();
    }

    #[test]
    fn test_mount_failure_carries_diagnostic_and_frees_lock() {
        let mut engine = FakeEngine::new();
        engine.mount_error = Some(EngineError::new(
            "mount",
            Some(0xC142_0127),
            "image is already mounted for read/write access",
        ));
        let f = fixture(engine);
        let manager = MountManager::new(&f.ctx);

        let err = manager.acquire().unwrap_err();
        match err {
            ServicingError::MountFailed { diagnostic, .. } => {
                assert!(diagnostic.contains("already mounted"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!f.ctx.record_path().exists());
        assert_eq!(manager.inspect().unwrap(), MountHealth::Clean);
    }

    #[test]
    fn test_missing_image_fails_before_engine() {
        let f = fixture(FakeEngine::new());
        fs::remove_file(&f.ctx.image).unwrap();
        let err = MountManager::new(&f.ctx).acquire().unwrap_err();
        assert!(matches!(err, ServicingError::MountFailed { .. }));
        assert_eq!(f.engine.count("mount"), 0);
    }

    #[test]
    fn test_inspect_busy_while_session_live() {
        let f = fixture(FakeEngine::new());
        let manager = MountManager::new(&f.ctx);
        let session = manager.acquire().unwrap();
        assert!(matches!(
            manager.inspect(),
            Err(ServicingError::ResourceBusy { .. })
        ));
        manager.release(session, false).unwrap();
        assert_eq!(manager.inspect().unwrap(), MountHealth::Clean);
    }

    fn simulate_crash(f: &Fixture, status: MountStatus, populate: bool) {
        f.engine.register_stale_mount(&f.ctx.mount_point, status);
        fs::create_dir_all(&f.ctx.mount_point).unwrap();
        if populate {
            fs::create_dir_all(f.ctx.mount_point.join("Windows")).unwrap();
        }
        record::write(
            &f.ctx.record_path(),
            &SessionRecord {
                image: f.ctx.image.clone(),
                index: 1,
                mount_point: f.ctx.mount_point.clone(),
                state: MountState::Dirty,
                acquired_at_utc: "20261017T230000Z".to_string(),
                owner_pid: 1,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_orphan_recovery() {
        let f = fixture(FakeEngine::new());
        simulate_crash(&f, MountStatus::Ok, false);
        let manager = MountManager::new(&f.ctx);

        assert!(matches!(
            manager.acquire(),
            Err(ServicingError::ResourceBusy { .. })
        ));
        assert_eq!(manager.inspect().unwrap(), MountHealth::Orphaned);
        assert_eq!(
            manager.repair(true, &Unattended).unwrap(),
            MountState::Unmounted
        );
        assert!(!f.ctx.record_path().exists());
        assert!(!f.engine.is_mounted(&f.ctx.mount_point));

        let session = manager.acquire().unwrap();
        manager.release(session, false).unwrap();
    }

    #[test]
    fn test_damaged_record_is_corrupt_and_repairable() {
        let f = fixture(FakeEngine::new());
        simulate_crash(&f, MountStatus::Ok, true);
        fs::write(f.ctx.record_path(), b"{\"mount_point\":").unwrap();
        let manager = MountManager::new(&f.ctx);

        assert!(matches!(
            manager.acquire(),
            Err(ServicingError::ResourceBusy { .. })
        ));
        assert_eq!(manager.inspect().unwrap(), MountHealth::Corrupt);
        assert_eq!(
            manager.repair(true, &Unattended).unwrap(),
            MountState::Unmounted
        );
        assert!(!f.ctx.record_path().exists());
        assert!(!f.engine.is_mounted(&f.ctx.mount_point));

        let session = manager.acquire().unwrap();
        manager.release(session, false).unwrap();
    }

    #[test]
    fn test_inspect_corrupt_when_engine_flags_mount() {
        let f = fixture(FakeEngine::new());
        simulate_crash(&f, MountStatus::NeedsRemount, true);
        let manager = MountManager::new(&f.ctx);
        assert_eq!(manager.inspect().unwrap(), MountHealth::Corrupt);
        assert_eq!(
            manager.repair(true, &Unattended).unwrap(),
            MountState::Unmounted
        );
        assert_eq!(manager.inspect().unwrap(), MountHealth::Clean);
    }

    #[test]
    fn test_inspect_corrupt_when_health_check_fails() {
        let mut engine = FakeEngine::new();
        engine.health_error = Some(EngineError::local("check-health", "hive missing"));
        let f = fixture(engine);
        simulate_crash(&f, MountStatus::Ok, true);
        assert_eq!(
            MountManager::new(&f.ctx).inspect().unwrap(),
            MountHealth::Corrupt
        );
    }

    #[test]
    fn test_intact_unowned_mount_is_orphaned() {
        let f = fixture(FakeEngine::new());
        simulate_crash(&f, MountStatus::Ok, true);
        assert_eq!(
            MountManager::new(&f.ctx).inspect().unwrap(),
            MountHealth::Orphaned
        );
    }

    #[test]
    fn test_interactive_repair_requires_confirmation() {
        let f = fixture(FakeEngine::new());
        simulate_crash(&f, MountStatus::Ok, false);
        let manager = MountManager::new(&f.ctx);

        let err = manager.repair(false, &Confirming(false)).unwrap_err();
        assert!(matches!(err, ServicingError::RepairDeclined { .. }));
        assert!(f.ctx.record_path().exists());

        assert_eq!(
            manager.repair(false, &Confirming(true)).unwrap(),
            MountState::Unmounted
        );
    }

    #[test]
    fn test_failed_commit_still_discards() {
        let mut engine = FakeEngine::new();
        engine.commit_error = Some(EngineError::new("commit", Some(0x8007_0070), "disk full"));
        let f = fixture(engine);
        let manager = MountManager::new(&f.ctx);

        let session = manager.acquire().unwrap();
        let err = manager.release(session, true).unwrap_err();
        assert!(matches!(err, ServicingError::ReleaseFailed { .. }));
        assert!(!f.engine.is_mounted(&f.ctx.mount_point));
        assert!(!f.ctx.record_path().exists());
        assert_eq!(f.engine.count("unmount"), 2);
    }

    #[test]
    fn test_dropped_session_discards() {
        let f = fixture(FakeEngine::new());
        let manager = MountManager::new(&f.ctx);
        {
            let _session = manager.acquire().unwrap();
        }
        assert!(!f.engine.is_mounted(&f.ctx.mount_point));
        assert!(f
            .engine
            .calls()
            .iter()
            .any(|c| c.ends_with("discard")));
        assert_eq!(manager.inspect().unwrap(), MountHealth::Clean);
    }

    #[test]
    fn test_same_path_normalizes() {
        assert!(same_path(Path::new("C:\\Mount\\"), Path::new("c:/mount")));
        assert!(!same_path(Path::new("C:\\Mount"), Path::new("C:\\Other")));
    }
}
