//! External tool invocation.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Captured result of a finished tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `program` with `args` to completion, capturing its output.
///
/// A missing binary is reported as `MissingTool`; a non-zero exit is not an
/// error here and is left to the caller to interpret.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned.
pub async fn run_tool(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &[(&'static str, String)],
) -> Result<ToolOutput> {
    debug!(program, args = %args.join(" "), "Running external tool");

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvisionError::MissingTool(program.to_string())
        } else {
            ProvisionError::Io(e)
        }
    })?;

    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Render a command line for error messages.
#[must_use]
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// The tail of a tool's stderr, which is where the actual error usually is.
#[must_use]
pub fn stderr_excerpt(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(12);
    lines[start..].join("\n")
}
