//! Preflight checks for a servicing run.
//!
//! Validates that the host has the native servicing tools before anything is
//! mounted. A missing tool discovered halfway through a run would leave a
//! mounted image behind.
//!
//! # Example
//!
//! ```rust,no_run
//! use image_servicer::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("dism") {
//!     println!("DISM is not on PATH");
//! }
//!
//! let tools = &[("dism", "Deployment Image Servicing and Management")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools a servicing run shells out to.
///
/// Each tuple is (command_name, what provides it).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("dism", "Windows ADK Deployment Tools or %SystemRoot%\\System32"),
    ("reg", "%SystemRoot%\\System32"),
    ("expand", "%SystemRoot%\\System32"),
];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and where it comes from.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (provided by: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check every tool in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
