//! Run context shared by every component call.
//!
//! The working directory owns all machine-global state of a run: the mount
//! lock, the session record, scratch space and run reports. Components never
//! read ambient globals; they take a `&RunContext`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::control::CancellationToken;
use crate::engine::ImageEngine;

/// Lock file guarding the mount resource of a working directory.
pub const MOUNT_LOCK_FILENAME: &str = "mount.lock";
/// Session record describing the live (or orphaned) mount.
pub const SESSION_RECORD_FILENAME: &str = "mount-session.json";

/// Everything a servicing run needs to know about where it operates.
#[derive(Clone)]
pub struct RunContext {
    pub engine: Arc<dyn ImageEngine>,
    /// Directory holding the mount lock, scratch space and run reports.
    pub working_dir: PathBuf,
    pub mount_point: PathBuf,
    pub image: PathBuf,
    pub index: u32,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        engine: Arc<dyn ImageEngine>,
        working_dir: PathBuf,
        mount_point: PathBuf,
        image: PathBuf,
        index: u32,
    ) -> Self {
        Self {
            engine,
            working_dir,
            mount_point,
            image,
            index,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn engine(&self) -> &dyn ImageEngine {
        self.engine.as_ref()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.working_dir.join(MOUNT_LOCK_FILENAME)
    }

    pub fn record_path(&self) -> PathBuf {
        self.working_dir.join(SESSION_RECORD_FILENAME)
    }

    /// Per-package scratch directory for re-derived package representations.
    pub fn scratch_dir(&self, item: &str) -> PathBuf {
        self.working_dir.join("scratch").join(sanitize(item))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.working_dir.join("runs")
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

/// Reduce an identifier to a safe single path segment.
pub(crate) fn sanitize(item: &str) -> String {
    let cleaned: String = item
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// Default working directory: `<local data dir>/image-servicer`.
pub fn default_working_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("image-servicer")
}
