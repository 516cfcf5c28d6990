//! Native image-servicing engine seam.
//!
//! Everything that actually touches an image goes through [`ImageEngine`].
//! The production implementation is [`dism::DismEngine`], which shells out to
//! the Windows servicing tools. Tests use an in-memory fake.
//!
//! ```text
//! orchestrator ──► mount manager ──┐
//!        │                         ├──► ImageEngine (dism.exe / reg.exe / expand.exe)
//!        └──► update resolver ─────┘
//! ```

mod command;
pub mod dism;
pub mod parse;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub use dism::DismEngine;

/// HRESULTs that mean "the payload was not in the form the engine expected".
pub const FORMAT_MISMATCH_CODES: &[u32] = &[
    0x8007_000D, // ERROR_INVALID_DATA
    0x800F_0820, // CBS_E_INVALID_PACKAGE
    0x8007_0570, // ERROR_FILE_CORRUPT
    0x800F_082F, // CBS_E_UNEXPECTED_PROCESSOR_ARCHITECTURE_OR_FORMAT
];

/// HRESULT for a package that does not apply to the target image.
pub const NOT_APPLICABLE_CODE: u32 = 0x800F_081E;

/// Coarse classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// Wrong container interpretation; eligible for the single fallback.
    FormatMismatch,
    /// Payload is valid but does not target this image.
    NotApplicable,
    Other,
}

impl EngineErrorKind {
    /// Map an engine exit code to a failure class.
    pub fn from_code(code: Option<u32>) -> Self {
        match code {
            Some(c) if FORMAT_MISMATCH_CODES.contains(&c) => EngineErrorKind::FormatMismatch,
            Some(NOT_APPLICABLE_CODE) => EngineErrorKind::NotApplicable,
            _ => EngineErrorKind::Other,
        }
    }
}

/// Failure reported by a native primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed{}: {diagnostic}", code_suffix(.code))]
pub struct EngineError {
    pub operation: String,
    pub kind: EngineErrorKind,
    pub code: Option<u32>,
    pub diagnostic: String,
}

fn code_suffix(code: &Option<u32>) -> String {
    code.map(|c| format!(" (0x{c:08X})")).unwrap_or_default()
}

impl EngineError {
    pub fn new(operation: impl Into<String>, code: Option<u32>, diagnostic: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: EngineErrorKind::from_code(code),
            code,
            diagnostic: diagnostic.into(),
        }
    }

    /// Failure that never ran the native tool (spawn error, missing file).
    pub fn local(operation: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: EngineErrorKind::Other,
            code: None,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_format_mismatch(&self) -> bool {
        self.kind == EngineErrorKind::FormatMismatch
    }
}

/// Metadata for one image inside an image file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageInfo {
    pub index: u32,
    pub name: String,
    pub edition: Option<String>,
    pub architecture: Option<String>,
    /// Dotted build, e.g. `10.0.22621.2428`.
    pub version: String,
    pub languages: Vec<String>,
}

/// Engine-reported status of a mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Ok,
    NeedsRemount,
    Invalid,
    Unknown,
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStatus::Ok => write!(f, "Ok"),
            MountStatus::NeedsRemount => write!(f, "Needs Remount"),
            MountStatus::Invalid => write!(f, "Invalid"),
            MountStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One entry of the engine's machine-wide mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedImage {
    pub mount_dir: PathBuf,
    pub image_file: PathBuf,
    pub index: u32,
    pub status: MountStatus,
}

/// A provisioned (per-image) app package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedAppx {
    pub display_name: String,
    pub package_name: String,
}

/// Primitive operations of the native servicing toolkit.
///
/// Implementations must be callable from a single orchestration thread; the
/// `Send + Sync` bound only lets sessions hold the engine behind an `Arc`.
pub trait ImageEngine: Send + Sync {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, EngineError>;

    fn mount(&self, image: &Path, index: u32, mount_point: &Path) -> Result<(), EngineError>;

    /// Unmount, saving changes when `commit` is true and discarding otherwise.
    fn unmount(&self, mount_point: &Path, commit: bool) -> Result<(), EngineError>;

    /// Machine-wide list of mounted images.
    fn mounted_images(&self) -> Result<Vec<MountedImage>, EngineError>;

    /// Release engine-side resources held by stale mounts.
    fn cleanup_mounts(&self) -> Result<(), EngineError>;

    /// Integrity check of a mounted image.
    fn check_health(&self, mount_point: &Path) -> Result<(), EngineError>;

    /// Returns the number of driver packages installed.
    fn add_driver(&self, mount_point: &Path, driver: &Path, recurse: bool) -> Result<usize, EngineError>;

    fn add_package(&self, mount_point: &Path, package: &Path) -> Result<(), EngineError>;

    /// Expand a wrapped package into `dest`, returning the extracted files.
    fn expand_package(&self, package: &Path, dest: &Path) -> Result<Vec<PathBuf>, EngineError>;

    fn add_capability(&self, mount_point: &Path, capability: &str, source: Option<&Path>) -> Result<(), EngineError>;

    fn add_provisioned_appx(&self, mount_point: &Path, package: &Path, license: Option<&Path>) -> Result<(), EngineError>;

    fn provisioned_appx(&self, mount_point: &Path) -> Result<Vec<ProvisionedAppx>, EngineError>;

    fn remove_provisioned_appx(&self, mount_point: &Path, package_name: &str) -> Result<(), EngineError>;

    /// Load an offline hive file under `HKLM\<key>`.
    fn load_hive(&self, key: &str, hive_file: &Path) -> Result<(), EngineError>;

    fn import_registry(&self, reg_file: &Path) -> Result<(), EngineError>;

    fn unload_hive(&self, key: &str) -> Result<(), EngineError>;

    fn export_image(&self, source: &Path, index: u32, destination: &Path, name: Option<&str>) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_code() {
        assert_eq!(
            EngineErrorKind::from_code(Some(0x8007_000D)),
            EngineErrorKind::FormatMismatch
        );
        assert_eq!(
            EngineErrorKind::from_code(Some(NOT_APPLICABLE_CODE)),
            EngineErrorKind::NotApplicable
        );
        assert_eq!(EngineErrorKind::from_code(Some(5)), EngineErrorKind::Other);
        assert_eq!(EngineErrorKind::from_code(None), EngineErrorKind::Other);
    }

    #[test]
    fn test_engine_error_display_includes_hresult() {
        let err = EngineError::new("add-package", Some(0x800F_081E), "not applicable");
        assert_eq!(
            err.to_string(),
            "add-package failed (0x800F081E): not applicable"
        );
        let local = EngineError::local("mount", "dism not found");
        assert_eq!(local.to_string(), "mount failed: dism not found");
    }
}
