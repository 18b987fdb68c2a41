//! Kubeconfig locations and API clients.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// The operator's default kubeconfig (`$KUBECONFIG` or `~/.kube/config`).
#[must_use]
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Some(first) = std::env::var_os("KUBECONFIG")
        .as_deref()
        .and_then(|v| std::env::split_paths(v).find(|p| !p.as_os_str().is_empty()))
    {
        return Some(first);
    }
    dirs::home_dir().map(|h| h.join(".kube").join("config"))
}

/// Build an API client from a kubeconfig file.
///
/// # Errors
///
/// Returns an error if the file is missing or invalid.
pub async fn client_from_path(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        ProvisionError::InvalidConfig(format!("kubeconfig {}: {e}", path.display()))
    })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            ProvisionError::InvalidConfig(format!("kubeconfig {}: {e}", path.display()))
        })?;
    debug!(cluster_url = %config.cluster_url, "Built Kubernetes client");
    Ok(Client::try_from(config)?)
}
