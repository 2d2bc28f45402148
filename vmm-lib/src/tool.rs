// SPDX-License-Identifier: GPL-2.0-only

//! Invocation of host tools (`ip`, `iptables`, `mount`, `resize2fs`, ...).
//!
//! Every mutating host operation goes through [`run`] so that a non-zero
//! exit carries the tool name and its captured output.

use std::ffi::OsStr;
use std::process::{Command, Output};

/// A host tool could not be spawned or exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{tool} failed: {output}")]
pub struct ToolError {
    pub tool: String,
    pub output: String,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, output: impl Into<String>) -> Self {
        ToolError {
            tool: tool.into(),
            output: output.into(),
        }
    }

    /// True when the captured output mentions `needle` (e.g. "File exists").
    pub fn mentions(&self, needle: &str) -> bool {
        self.output.contains(needle)
    }
}

/// Run `tool` with `args`, returning stdout on success.
pub fn run<I, S>(tool: &str, args: I) -> Result<String, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ToolError::new(tool, format!("cannot execute: {e}")))?;
    check(tool, output)
}

/// Run `tool` and report only whether it exited zero.
/// Spawn failures are still errors.
pub fn probe<I, S>(tool: &str, args: I) -> Result<bool, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ToolError::new(tool, format!("cannot execute: {e}")))?;
    Ok(output.status.success())
}

fn check(tool: &str, output: Output) -> Result<String, ToolError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let captured = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    let captured = if captured.is_empty() {
        format!("exited with {}", output.status)
    } else {
        captured
    };
    Err(ToolError::new(tool, captured))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_stdout_on_success() {
        let out = run("sh", ["-c", "echo hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_captures_stderr_on_failure() {
        let err = run("sh", ["-c", "echo oops >&2; exit 3"]).unwrap_err();
        assert_eq!(err.tool, "sh");
        assert_eq!(err.output, "oops");
        assert!(err.mentions("oops"));
    }

    #[test]
    fn run_falls_back_to_stdout_when_stderr_empty() {
        let err = run("sh", ["-c", "echo on-stdout; exit 1"]).unwrap_err();
        assert_eq!(err.output, "on-stdout");
    }

    #[test]
    fn run_reports_missing_binary() {
        let err = run("/nonexistent/tool", ["x"]).unwrap_err();
        assert_eq!(err.tool, "/nonexistent/tool");
        assert!(err.output.contains("cannot execute"));
    }

    #[test]
    fn probe_reports_exit_status() {
        assert!(probe("sh", ["-c", "exit 0"]).unwrap());
        assert!(!probe("sh", ["-c", "exit 1"]).unwrap());
    }
}
