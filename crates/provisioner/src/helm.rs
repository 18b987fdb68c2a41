//! Chart installer adapter.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::config::Stage;
use crate::credentials::PipelineCredentials;
use crate::database::DatabaseRelease;
use crate::engine::{with_retry, FailureContext};
use crate::error::{ProvisionError, Result};
use crate::process::{display_command, run_tool};
use crate::state::RetryConfig;

/// Values file name inside the database stage directory.
pub const VALUES_FILE: &str = "values.yaml";

/// Installs and removes chart releases.
#[async_trait]
pub trait ReleaseDeployer: Send + Sync {
    /// Register the release's chart repository and refresh its index.
    async fn add_repo(&self, release: &DatabaseRelease) -> Result<()>;

    /// Whether the release is already installed.
    async fn is_installed(&self, release: &DatabaseRelease, kubeconfig: &Path) -> Result<bool>;

    /// Install or upgrade the release with the given values file.
    async fn upgrade_install(
        &self,
        release: &DatabaseRelease,
        values_file: &Path,
        kubeconfig: &Path,
    ) -> Result<()>;

    /// Remove the release. Removing an absent release succeeds.
    async fn uninstall(&self, release: &DatabaseRelease, kubeconfig: &Path) -> Result<()>;
}

/// Write the release's values next to the other rendered files.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_values(dir: &Path, release: &DatabaseRelease) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(VALUES_FILE);
    let yaml = serde_yaml::to_string(&release.values())
        .map_err(|e| ProvisionError::InvalidConfig(format!("chart values: {e}")))?;
    std::fs::write(&path, yaml)?;
    Ok(path)
}

/// `helm` command-line adapter.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
    env: Vec<(&'static str, String)>,
    retry: RetryConfig,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: "helm".into(),
            env: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl HelmCli {
    /// Inject credentials, used by the cluster's token helper.
    #[must_use]
    pub fn with_credentials(mut self, credentials: &PipelineCredentials) -> Self {
        self.env.extend(credentials.env_pairs());
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let command = display_command(&self.binary, &args);
        with_retry(&self.retry, &command, || async {
            let out = run_tool(&self.binary, &args, None, &self.env).await?;
            if out.success() {
                Ok(out.stdout)
            } else {
                Err(crate::engine::classify_failure(
                    Stage::Database,
                    &command,
                    &out.stderr,
                    &FailureContext::default(),
                ))
            }
        })
        .await
    }
}

#[async_trait]
impl ReleaseDeployer for HelmCli {
    async fn add_repo(&self, release: &DatabaseRelease) -> Result<()> {
        self.run(vec![
            "repo".into(),
            "add".into(),
            release.repo_name().into(),
            release.chart_repo.clone(),
            "--force-update".into(),
        ])
        .await?;
        self.run(vec!["repo".into(), "update".into(), release.repo_name().into()])
            .await?;
        Ok(())
    }

    async fn is_installed(&self, release: &DatabaseRelease, kubeconfig: &Path) -> Result<bool> {
        match self
            .run(vec![
                "status".into(),
                release.release_name.clone(),
                "--namespace".into(),
                release.namespace.clone(),
                "--kubeconfig".into(),
                kubeconfig.display().to_string(),
            ])
            .await
        {
            Ok(_) => Ok(true),
            Err(ProvisionError::Engine { stderr, .. }) if stderr.contains("not found") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn upgrade_install(
        &self,
        release: &DatabaseRelease,
        values_file: &Path,
        kubeconfig: &Path,
    ) -> Result<()> {
        self.run(vec![
            "upgrade".into(),
            "--install".into(),
            release.release_name.clone(),
            release.chart.clone(),
            "--version".into(),
            release.chart_version.clone(),
            "--namespace".into(),
            release.namespace.clone(),
            "--create-namespace".into(),
            "--kubeconfig".into(),
            kubeconfig.display().to_string(),
            "-f".into(),
            values_file.display().to_string(),
        ])
        .await?;
        info!(
            release = %release.release_name,
            namespace = %release.namespace,
            "Chart release installed"
        );
        Ok(())
    }

    async fn uninstall(&self, release: &DatabaseRelease, kubeconfig: &Path) -> Result<()> {
        match self
            .run(vec![
                "uninstall".into(),
                release.release_name.clone(),
                "--namespace".into(),
                release.namespace.clone(),
                "--kubeconfig".into(),
                kubeconfig.display().to_string(),
            ])
            .await
        {
            Ok(_) => {
                info!(release = %release.release_name, "Chart release removed");
                Ok(())
            }
            Err(ProvisionError::Engine { stderr, .. }) if stderr.contains("not found") => {
                info!(release = %release.release_name, "Chart release already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
