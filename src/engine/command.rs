//! Builder for native tool invocations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::parse::error_code_from_output;
use super::EngineError;

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolOutput {
    pub(crate) stdout: String,
}

/// A single invocation of `dism.exe`, `reg.exe` or `expand.exe`.
#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    program: PathBuf,
    operation: &'static str,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub(crate) fn new(program: &Path, operation: &'static str) -> Self {
        Self {
            program: program.to_path_buf(),
            operation,
            args: Vec::new(),
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `/Name:value` style switch.
    pub(crate) fn switch(self, name: &str, value: impl std::fmt::Display) -> Self {
        self.arg(format!("/{name}:{value}"))
    }

    pub(crate) fn switch_path(self, name: &str, value: &Path) -> Self {
        self.switch(name, value.display())
    }

    pub(crate) fn flag(self, name: &str) -> Self {
        self.arg(format!("/{name}"))
    }

    pub(crate) fn flag_if(self, name: &str, enabled: bool) -> Self {
        if enabled {
            self.flag(name)
        } else {
            self
        }
    }

    pub(crate) fn run(self) -> Result<ToolOutput, EngineError> {
        debug!(program = %self.program.display(), args = ?self.args, "running native tool");
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| {
                EngineError::local(
                    self.operation,
                    format!("failed to run '{}': {}", self.program.display(), e),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(ToolOutput { stdout });
        }

        // The servicing tools exit with the HRESULT; fall back to the text.
        let code = output
            .status
            .code()
            .map(|c| c as u32)
            .filter(|c| *c > 0xFF)
            .or_else(|| error_code_from_output(&stdout));
        Err(EngineError::new(
            self.operation,
            code,
            format!("{}\n{}", stdout.trim(), stderr.trim()).trim().to_string(),
        ))
    }
}
