//! Shared fixtures for unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::context::RunContext;
use crate::engine::fake::FakeEngine;

pub(crate) struct Fixture {
    pub(crate) tmp: TempDir,
    pub(crate) ctx: RunContext,
    pub(crate) engine: Arc<FakeEngine>,
}

impl Fixture {
    pub(crate) fn new(engine: FakeEngine) -> Self {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("install.wim");
        fs::write(&image, b"MSWIM\0\0\0").unwrap();
        let engine = Arc::new(engine);
        let ctx = RunContext::new(
            engine.clone(),
            tmp.path().join("work"),
            tmp.path().join("mnt"),
            image,
            1,
        );
        Self { tmp, ctx, engine }
    }

    /// Write `bytes` to `name` under a `payloads/` directory.
    pub(crate) fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.tmp.path().join("payloads").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    pub(crate) fn root(&self) -> &Path {
        self.tmp.path()
    }
}

/// Minimal cabinet: 36-byte header, one folder entry, then the file table.
pub(crate) fn cab_bytes(names: &[&str]) -> Vec<u8> {
    let folders: u16 = 1;
    let coff_files = 36u32 + 8 * u32::from(folders);
    let mut out = Vec::new();
    out.extend_from_slice(b"MSCF");
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved1
    out.extend_from_slice(&0u32.to_le_bytes()); // cbCabinet
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved2
    out.extend_from_slice(&coff_files.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved3
    out.extend_from_slice(&[3, 1]); // version
    out.extend_from_slice(&folders.to_le_bytes());
    out.extend_from_slice(&(names.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&0u16.to_le_bytes()); // setID
    out.extend_from_slice(&0u16.to_le_bytes()); // iCabinet
    out.extend_from_slice(&[0u8; 8]); // CFFOLDER
    for name in names {
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}
