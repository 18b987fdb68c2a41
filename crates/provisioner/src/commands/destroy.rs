use anyhow::Result;
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};

use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;

use super::GlobalArgs;

/// Tear down an environment: database, then cluster, then network
#[derive(Args, Debug)]
pub struct DestroyCommand {
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,
}

impl DestroyCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_section("Destroying environment");

        PrerequisitesValidator::full().validate()?;
        let provisioner = global.provisioner(None)?;
        let env = provisioner.environment();
        ui::print_kv("Environment", &env.params.env_prefix);
        ui::print_kv("Cluster", &env.params.cluster_name);
        ui::print_kv("Region", &env.params.region);
        ui::print_kv("State prefix", &env.lease_key());
        println!();

        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Destroy every resource of environment '{}'?",
                    env.params.env_prefix
                ))
                .default(false)
                .interact()?;

            if !proceed {
                println!("{}", "Destroy cancelled.".yellow());
                return Ok(());
            }
        }

        let removed = provisioner.destroy().await?;
        let names: Vec<String> = removed.iter().map(ToString::to_string).collect();
        ui::print_success(&format!("Removed: {}", names.join(", ")));
        Ok(())
    }
}
