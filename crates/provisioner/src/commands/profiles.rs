use anyhow::{Context, Result};
use clap::Args;

use eksprov::cloud::{AwsCli, CloudAccess};
use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;

use super::GlobalArgs;

/// List the serverless profiles of a cluster
#[derive(Args, Debug)]
pub struct ProfilesCommand {}

impl ProfilesCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        PrerequisitesValidator::cloud_only().validate()?;
        let env = global.resolve()?;

        let profiles = AwsCli::default()
            .list_fargate_profiles(&env.params.cluster_name, &env.params.region)
            .await
            .context("Failed to list serverless profiles")?;

        ui::print_section(&format!("Serverless profiles of {}", env.params.cluster_name));
        if profiles.is_empty() {
            ui::print_warning("No serverless profiles found");
        }
        for name in &profiles {
            let configured = name == &env.cluster.serverless_profile.name;
            ui::print_check_result(
                name,
                configured,
                Some(if configured { "configured" } else { "not in configuration" }),
            );
        }
        Ok(())
    }
}
