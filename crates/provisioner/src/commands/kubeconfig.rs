use anyhow::{Context, Result};
use clap::Args;

use eksprov::cloud::{AwsCli, CloudAccess};
use eksprov::kubeconfig::default_kubeconfig_path;
use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;

use super::GlobalArgs;

/// Merge cluster access into the local kube configuration
#[derive(Args, Debug)]
pub struct KubeconfigCommand {}

impl KubeconfigCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        PrerequisitesValidator::cloud_only().validate()?;
        let env = global.resolve()?;

        AwsCli::default()
            .update_kubeconfig(&env.params.cluster_name, &env.params.region, None)
            .await
            .context("Failed to update kubeconfig")?;

        let target = default_kubeconfig_path()
            .map_or_else(|| "default kubeconfig".to_string(), |p| p.display().to_string());
        ui::print_success(&format!(
            "Access to {} merged into {target}",
            env.params.cluster_name
        ));
        Ok(())
    }
}
