//! Container format sniffing.
//!
//! The extension of an update file is not trustworthy: vendors ship bare
//! cabinets named `.msu` and wrappers named `.cab`. The structure decides:
//!
//! - a WIM header (`MSWIM\0\0\0`) is the newer wrapped layout
//! - a cabinet whose file table lists nested payloads is a wrapper
//! - a cabinet carrying `update.mum` or component manifests is bare
//!
//! Only when none of these match does the extension decide.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::warn;

use super::ContainerFormat;
use crate::error::{Result, ServicingError};

const WIM_MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
const CAB_MAGIC: &[u8; 4] = b"MSCF";
const CAB_HEADER_LEN: usize = 36;
const CFFILE_FIXED_LEN: i64 = 16;
const MAX_NAME_LEN: usize = 512;

/// Classify `path` by inspecting its internal structure.
pub fn classify_container(path: &Path) -> Result<ContainerFormat> {
    let file = File::open(path).map_err(|e| ServicingError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; CAB_HEADER_LEN];
    let read = read_up_to(&mut reader, &mut header).map_err(|e| ServicingError::io(path, e))?;
    let header = &header[..read];

    if header.starts_with(WIM_MAGIC) {
        return Ok(ContainerFormat::Wrapped);
    }
    if header.len() == CAB_HEADER_LEN && header.starts_with(CAB_MAGIC) {
        // A truncated or odd file table falls through to the extension.
        if let Ok(names) = cab_file_names(&mut reader, header) {
            if let Some(format) = format_from_names(&names) {
                return Ok(format);
            }
        }
    }

    let by_extension = format_from_extension(path);
    warn!(
        package = %path.display(),
        format = %by_extension,
        "container structure not recognized; falling back to file extension"
    );
    Ok(by_extension)
}

fn format_from_names(names: &[String]) -> Option<ContainerFormat> {
    let lower: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
    let nested = |n: &String| {
        n.ends_with(".cab") || n.ends_with(".wim") || n.ends_with(".psf")
    };
    if lower.iter().any(nested) {
        return Some(ContainerFormat::Wrapped);
    }
    let bare = |n: &String| {
        let leaf = n.rsplit(['\\', '/']).next().unwrap_or(n);
        leaf == "update.mum" || leaf.ends_with(".mum") || leaf.ends_with(".manifest")
    };
    if lower.iter().any(bare) {
        return Some(ContainerFormat::Bare);
    }
    None
}

fn format_from_extension(path: &Path) -> ContainerFormat {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("msu") => ContainerFormat::Wrapped,
        _ => ContainerFormat::Bare,
    }
}

/// Names from a cabinet's CFFILE table.
fn cab_file_names<R: BufRead + Seek>(reader: &mut R, header: &[u8]) -> std::io::Result<Vec<String>> {
    let coff_files = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    let file_count = u16::from_le_bytes([header[28], header[29]]);

    reader.seek(SeekFrom::Start(u64::from(coff_files)))?;
    let mut names = Vec::with_capacity(usize::from(file_count));
    for _ in 0..file_count {
        reader.seek(SeekFrom::Current(CFFILE_FIXED_LEN))?;
        let mut raw = Vec::new();
        reader
            .by_ref()
            .take(MAX_NAME_LEN as u64 + 1)
            .read_until(0, &mut raw)?;
        if raw.last() != Some(&0) || raw.len() > MAX_NAME_LEN {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        raw.pop();
        names.push(String::from_utf8_lossy(&raw).into_owned());
    }
    Ok(names)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
