//! Pipeline output variables.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ProvisionError, Result};

/// Environment variable naming the CI output file.
pub const GITHUB_OUTPUT_VAR: &str = "GITHUB_OUTPUT";

/// Name of the published endpoint variable.
pub const CLUSTER_ENDPOINT: &str = "cluster_endpoint";

/// Append `name=value` to `target`, or to `$GITHUB_OUTPUT` when no target
/// is given. Returns the file written, if any.
///
/// # Errors
///
/// Returns an error if the value spans lines or the file cannot be written.
pub fn emit_output(name: &str, value: &str, target: Option<&Path>) -> Result<Option<PathBuf>> {
    if value.contains(['\n', '\r']) {
        return Err(ProvisionError::InvalidConfig(format!(
            "output '{name}' must be a single line"
        )));
    }

    let path = target
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(GITHUB_OUTPUT_VAR).map(PathBuf::from))
        .filter(|p| !p.as_os_str().is_empty());

    info!(name, value, "Pipeline output");

    let Some(path) = path else {
        return Ok(None);
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{name}={value}")?;
    Ok(Some(path))
}
