//! On-disk session record for the mount resource.
//!
//! The record outlives a crashed process. Startup inspection reads it to find
//! mounts that no live session owns.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::MountState;
use crate::error::{Result, ServicingError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub image: PathBuf,
    pub index: u32,
    pub mount_point: PathBuf,
    pub state: MountState,
    pub acquired_at_utc: String,
    pub owner_pid: u32,
}

/// Contents of the record file.
#[derive(Debug)]
pub(crate) enum StoredRecord {
    Absent,
    Intact(SessionRecord),
    /// Present but unparsable, e.g. truncated by a crash or disk damage.
    Damaged(serde_json::Error),
}

pub(crate) fn read(path: &Path) -> Result<StoredRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoredRecord::Absent),
        Err(e) => return Err(ServicingError::io(path, e)),
    };
    Ok(match serde_json::from_slice(&bytes) {
        Ok(record) => StoredRecord::Intact(record),
        Err(e) => StoredRecord::Damaged(e),
    })
}

/// Like [`read`], but a damaged record is an error.
#[cfg(test)]
pub(crate) fn load(path: &Path) -> Result<Option<SessionRecord>> {
    match read(path)? {
        StoredRecord::Absent => Ok(None),
        StoredRecord::Intact(record) => Ok(Some(record)),
        StoredRecord::Damaged(e) => Err(e.into()),
    }
}

pub(crate) fn write(path: &Path, record: &SessionRecord) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| ServicingError::io(parent, e))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(record)?;
    fs::write(&tmp, payload).map_err(|e| ServicingError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ServicingError::io(path, e))?;
    Ok(())
}

pub(crate) fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ServicingError::io(path, e)),
    }
}
