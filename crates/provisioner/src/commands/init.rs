use anyhow::{Context, Result};
use clap::Args;

use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;

use super::GlobalArgs;

/// Render both stacks and initialize their remote state
#[derive(Args, Debug)]
pub struct InitCommand {}

impl InitCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_section("Initializing environment");

        PrerequisitesValidator::engine_only().validate()?;
        let provisioner = global.provisioner(None)?;
        let env = provisioner.environment();
        ui::print_kv("Environment", &env.params.env_prefix);
        ui::print_kv("State prefix", &env.lease_key());

        provisioner
            .init()
            .await
            .context("Failed to initialize stacks")?;

        ui::print_success("Stacks initialized");
        Ok(())
    }
}
