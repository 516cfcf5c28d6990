//! Offline registry injection.
//!
//! A `.reg` file written against a live system names keys such as
//! `HKEY_LOCAL_MACHINE\SOFTWARE\Policies`. Offline, the image's hive file is
//! loaded under a temporary key instead, so key headers are rewritten to point
//! at that key before import. The hive is unloaded again whatever the import
//! does, or the image cannot be unmounted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use super::{fold_items, ItemResult, StageWork};
use crate::context::RunContext;
use crate::control::Operator;
use crate::error::{Result, ServicingError};
use crate::mount::MountSession;
use crate::pipeline::Stage;

const UTF16_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineHive {
    Software,
    System,
    /// Profile template for the `.DEFAULT` user.
    Default,
    /// `NTUSER.DAT` of the default profile, inherited by new users.
    User,
}

impl OfflineHive {
    /// Hive file relative to the mount point.
    pub fn hive_file(self) -> &'static str {
        match self {
            OfflineHive::Software => "Windows/System32/config/SOFTWARE",
            OfflineHive::System => "Windows/System32/config/SYSTEM",
            OfflineHive::Default => "Windows/System32/config/DEFAULT",
            OfflineHive::User => "Users/Default/NTUSER.DAT",
        }
    }

    /// Temporary key under `HKLM` the hive is loaded at.
    pub fn load_key(self) -> &'static str {
        match self {
            OfflineHive::Software => "SERVICER_SOFTWARE",
            OfflineHive::System => "SERVICER_SYSTEM",
            OfflineHive::Default => "SERVICER_DEFAULT",
            OfflineHive::User => "SERVICER_NTUSER",
        }
    }

    fn live_roots(self) -> &'static [&'static str] {
        match self {
            OfflineHive::Software => &["HKEY_LOCAL_MACHINE\\SOFTWARE", "HKLM\\SOFTWARE"],
            OfflineHive::System => &["HKEY_LOCAL_MACHINE\\SYSTEM", "HKLM\\SYSTEM"],
            OfflineHive::Default => &["HKEY_USERS\\.DEFAULT", "HKU\\.DEFAULT"],
            OfflineHive::User => &["HKEY_CURRENT_USER", "HKCU"],
        }
    }
}

impl fmt::Display for OfflineHive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineHive::Software => write!(f, "software"),
            OfflineHive::System => write!(f, "system"),
            OfflineHive::Default => write!(f, "default"),
            OfflineHive::User => write!(f, "ntuser"),
        }
    }
}

impl FromStr for OfflineHive {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "software" | "hklm\\software" => Ok(OfflineHive::Software),
            "system" | "hklm\\system" => Ok(OfflineHive::System),
            "default" | ".default" => Ok(OfflineHive::Default),
            "ntuser" | "user" | "hkcu" => Ok(OfflineHive::User),
            other => Err(format!(
                "unknown hive '{other}' (expected software, system, default or ntuser)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryImport {
    pub file: PathBuf,
    pub hive: OfflineHive,
}

/// Point every key header in `content` that targets `hive` at its load key.
///
/// Keys for other roots are left alone; deletion headers (`[-...]`) are
/// rewritten too.
pub fn rewrite_reg_keys(content: &str, hive: OfflineHive) -> String {
    let target = format!("HKEY_LOCAL_MACHINE\\{}", hive.load_key());
    let mut out = String::with_capacity(content.len() + 64);
    for line in content.split_inclusive('\n') {
        out.push_str(&rewrite_line(line, hive, &target));
    }
    out
}

fn rewrite_line(line: &str, hive: OfflineHive, target: &str) -> String {
    let indent = line.len() - line.trim_start().len();
    let body = &line[indent..];
    let Some(rest) = body.strip_prefix('[') else {
        return line.to_string();
    };
    let (delete, key) = match rest.strip_prefix('-') {
        Some(key) => ("-", key),
        None => ("", rest),
    };
    for root in hive.live_roots() {
        if key.len() < root.len() || !key.is_char_boundary(root.len()) {
            continue;
        }
        let (head, tail) = key.split_at(root.len());
        if head.eq_ignore_ascii_case(root) && (tail.starts_with('\\') || tail.starts_with(']')) {
            return format!("{}[{delete}{target}{tail}", &line[..indent]);
        }
    }
    line.to_string()
}

enum RegEncoding {
    Utf16,
    Utf8 { bom: bool },
}

fn decode(bytes: &[u8]) -> (String, RegEncoding) {
    if let Some(body) = bytes.strip_prefix(&UTF16_BOM) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return (String::from_utf16_lossy(&units), RegEncoding::Utf16);
    }
    match bytes.strip_prefix(&UTF8_BOM) {
        Some(body) => (
            String::from_utf8_lossy(body).into_owned(),
            RegEncoding::Utf8 { bom: true },
        ),
        None => (
            String::from_utf8_lossy(bytes).into_owned(),
            RegEncoding::Utf8 { bom: false },
        ),
    }
}

fn encode(content: &str, encoding: &RegEncoding) -> Vec<u8> {
    match encoding {
        RegEncoding::Utf16 => {
            let mut out = UTF16_BOM.to_vec();
            for unit in content.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            out
        }
        RegEncoding::Utf8 { bom } => {
            let mut out = if *bom { UTF8_BOM.to_vec() } else { Vec::new() };
            out.extend_from_slice(content.as_bytes());
            out
        }
    }
}

/// Write the rewritten copy of `import` into `scratch`.
fn stage_rewritten(import: &RegistryImport, scratch: &Path, position: usize) -> Result<PathBuf> {
    let bytes = fs::read(&import.file).map_err(|e| ServicingError::io(&import.file, e))?;
    let (content, encoding) = decode(&bytes);
    let rewritten = rewrite_reg_keys(&content, import.hive);

    fs::create_dir_all(scratch).map_err(|e| ServicingError::io(scratch, e))?;
    let name = import
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("import.reg");
    let dest = scratch.join(format!("{position:02}-{name}"));
    fs::write(&dest, encode(&rewritten, &encoding)).map_err(|e| ServicingError::io(&dest, e))?;
    Ok(dest)
}

pub fn apply_registry(
    ctx: &RunContext,
    session: &mut MountSession,
    imports: &[RegistryImport],
    operator: &dyn Operator,
) -> Result<StageWork> {
    let scratch = ctx.scratch_dir("registry");
    let mut position = 0;
    let work = fold_items(
        ctx,
        operator,
        Stage::RegistryPolicy,
        imports,
        |i| i.file.display().to_string(),
        |import| {
            position += 1;
            let hive_file = session.mount_point().join(import.hive.hive_file());
            if !hive_file.is_file() {
                return Ok(ItemResult::Failed(format!(
                    "{} hive not found at '{}'",
                    import.hive,
                    hive_file.display()
                )));
            }
            let staged = match stage_rewritten(import, &scratch, position) {
                Ok(path) => path,
                Err(e) => return Ok(ItemResult::Failed(e.to_string())),
            };

            session.mark_dirty()?;
            let engine = ctx.engine();
            let key = import.hive.load_key();
            if let Err(e) = engine.load_hive(key, &hive_file) {
                return Ok(ItemResult::Failed(e.to_string()));
            }
            let imported = engine.import_registry(&staged);
            let unloaded = engine.unload_hive(key);
            Ok(match (imported, unloaded) {
                (Ok(()), Ok(())) => ItemResult::Done,
                (Err(e), Ok(())) => ItemResult::Failed(e.to_string()),
                (Ok(()), Err(u)) => ItemResult::Failed(format!("imported, but {u}")),
                (Err(e), Err(u)) => ItemResult::Failed(format!("{e}; {u}")),
            })
        },
    )?;

    if scratch.exists() {
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(path = %scratch.display(), error = %e, "could not remove registry scratch directory");
        }
    }
    Ok(work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Unattended;
    use crate::engine::fake::FakeEngine;
    use crate::mount::MountManager;
    use crate::testutil::Fixture;

    const POLICY: &str = "Windows Registry Editor Version 5.00\r\n\r\n\
[HKEY_LOCAL_MACHINE\\SOFTWARE\\Policies\\Microsoft\\Windows\\CloudContent]\r\n\
\"DisableWindowsConsumerFeatures\"=dword:00000001\r\n\r\n\
[-hklm\\software\\Contoso]\r\n\
[HKEY_LOCAL_MACHINE\\SYSTEM\\Setup]\r\n\
[HKEY_LOCAL_MACHINE\\SOFTWAREX]\r\n";

    #[test]
    fn test_rewrite_software_keys() {
        let out = rewrite_reg_keys(POLICY, OfflineHive::Software);
        assert!(out.contains(
            "[HKEY_LOCAL_MACHINE\\SERVICER_SOFTWARE\\Policies\\Microsoft\\Windows\\CloudContent]\r\n"
        ));
        assert!(out.contains("[-HKEY_LOCAL_MACHINE\\SERVICER_SOFTWARE\\Contoso]"));
        assert!(out.contains("[HKEY_LOCAL_MACHINE\\SYSTEM\\Setup]"));
        assert!(out.contains("[HKEY_LOCAL_MACHINE\\SOFTWAREX]"));
        assert!(out.contains("\"DisableWindowsConsumerFeatures\"=dword:00000001"));
    }

    #[test]
    fn test_rewrite_user_keys() {
        let out = rewrite_reg_keys("[HKEY_CURRENT_USER\\Control Panel\\Desktop]\n", OfflineHive::User);
        assert_eq!(out, "[HKEY_LOCAL_MACHINE\\SERVICER_NTUSER\\Control Panel\\Desktop]\n");
    }

    #[test]
    fn test_utf16_round_trip_keeps_encoding() {
        let original = encode(POLICY, &RegEncoding::Utf16);
        let (decoded, encoding) = decode(&original);
        assert_eq!(decoded, POLICY);
        assert!(matches!(encoding, RegEncoding::Utf16));
    }

    #[test]
    fn test_hive_parsing() {
        assert_eq!("SOFTWARE".parse::<OfflineHive>().unwrap(), OfflineHive::Software);
        assert_eq!("ntuser".parse::<OfflineHive>().unwrap(), OfflineHive::User);
        assert!("SAM".parse::<OfflineHive>().is_err());
    }

    #[test]
    fn test_hive_always_unloaded() {
        let f = Fixture::new(FakeEngine::new());
        let reg = f.file("policy.reg", &encode(POLICY, &RegEncoding::Utf16));
        let manager = MountManager::new(&f.ctx);
        let mut session = manager.acquire().unwrap();
        let imports = vec![
            RegistryImport {
                file: reg.clone(),
                hive: OfflineHive::Software,
            },
            RegistryImport {
                file: reg,
                hive: OfflineHive::System,
            },
        ];

        let work = apply_registry(&f.ctx, &mut session, &imports, &Unattended).unwrap();
        // The fake mount only lays out the SOFTWARE hive.
        assert_eq!(work.failures.len(), 1);
        assert!(work.failures[0].reason.contains("system hive not found"));
        assert_eq!(f.engine.count("load_hive"), 1);
        assert_eq!(f.engine.count("import"), 1);
        assert_eq!(f.engine.count("unload_hive"), 1);
        assert!(!f.ctx.scratch_dir("registry").exists());
        manager.release(session, false).unwrap();
    }
}
