//! Parsers for the text reports printed by the servicing tools.
//!
//! The tools print `Key : Value` records separated by blank lines. Parsing is
//! kept separate from process execution so it can be tested on captured
//! output.

use std::path::PathBuf;

use super::{ImageInfo, MountStatus, MountedImage, ProvisionedAppx};

/// Split output into records of `(key, value)` pairs.
///
/// Indented lines following a key with an empty value are folded into that
/// value as a comma-separated list (the `Languages :` block).
fn records(output: &str) -> Vec<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(" : ") {
            current.push((key.trim().to_string(), value.trim().to_string()));
            continue;
        }
        if let Some(key) = line.strip_suffix(" :") {
            current.push((key.trim().to_string(), String::new()));
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some((_, value)) = current.last_mut() {
                if !value.is_empty() {
                    value.push_str(", ");
                }
                value.push_str(line.trim());
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn field<'a>(record: &'a [(String, String)], key: &str) -> Option<&'a str> {
    record
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Parse `/Get-ImageInfo /Index:n` output.
///
/// The reported build is `Version` plus `ServicePack Build`, which is what the
/// version classifier expects (`10.0.22621` + `2428` → `10.0.22621.2428`).
pub fn parse_image_info(output: &str) -> Option<ImageInfo> {
    let records = records(output);
    let record = records
        .iter()
        .find(|r| field(r, "Index").is_some() && field(r, "Version").is_some())?;

    let index = field(record, "Index")?.parse().ok()?;
    let base = field(record, "Version")?;
    let version = match field(record, "ServicePack Build") {
        Some(sp) if !sp.is_empty() && base.split('.').count() == 3 => format!("{base}.{sp}"),
        _ => base.to_string(),
    };
    let languages = field(record, "Languages")
        .map(|v| {
            v.split(',')
                .map(|l| l.trim().trim_end_matches("(Default)").trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(ImageInfo {
        index,
        name: field(record, "Name").unwrap_or_default().to_string(),
        edition: field(record, "Edition").map(str::to_string),
        architecture: field(record, "Architecture").map(str::to_string),
        version,
        languages,
    })
}

/// Parse `/Get-MountedImageInfo` output.
pub fn parse_mounted_images(output: &str) -> Vec<MountedImage> {
    records(output)
        .iter()
        .filter_map(|record| {
            let mount_dir = field(record, "Mount Dir")?;
            let status = match field(record, "Status").unwrap_or_default() {
                s if s.eq_ignore_ascii_case("ok") => MountStatus::Ok,
                s if s.eq_ignore_ascii_case("needs remount") => MountStatus::NeedsRemount,
                s if s.eq_ignore_ascii_case("invalid") => MountStatus::Invalid,
                _ => MountStatus::Unknown,
            };
            Some(MountedImage {
                mount_dir: PathBuf::from(mount_dir),
                image_file: PathBuf::from(field(record, "Image File").unwrap_or_default()),
                index: field(record, "Image Index")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                status,
            })
        })
        .collect()
}

/// Parse `/Get-ProvisionedAppxPackages` output.
pub fn parse_provisioned_appx(output: &str) -> Vec<ProvisionedAppx> {
    records(output)
        .iter()
        .filter_map(|record| {
            Some(ProvisionedAppx {
                display_name: field(record, "DisplayName")?.to_string(),
                package_name: field(record, "PackageName")?.to_string(),
            })
        })
        .collect()
}

/// Pull the HRESULT out of an `Error: 0x800f081e` line.
pub fn error_code_from_output(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Error:")?.trim();
        let hex = rest
            .strip_prefix("0x")
            .or_else(|| rest.strip_prefix("0X"))?;
        u32::from_str_radix(hex.split_whitespace().next()?, 16).ok()
    })
}

/// Number of driver packages reported by `/Add-Driver`.
pub fn parse_driver_count(output: &str) -> usize {
    output
        .lines()
        .find(|l| l.contains("driver package"))
        .and_then(|line| {
            line.split_whitespace()
                .find_map(|word| word.parse::<usize>().ok())
        })
        .unwrap_or(0)
}
