use anyhow::{Context, Result};
use clap::Args;

use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;

use super::GlobalArgs;

/// Show what apply would change, per stage
#[derive(Args, Debug)]
pub struct PlanCommand {}

impl PlanCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_section("Planning environment");

        PrerequisitesValidator::engine_only().validate()?;
        let provisioner = global.provisioner(None)?;
        let plans = provisioner.plan().await.context("Failed to plan stacks")?;

        println!();
        for plan in &plans {
            match plan.outcome {
                Some(outcome) if outcome.changes => {
                    ui::print_warning(&format!("{}: {}", plan.stage, outcome.summary));
                }
                Some(_) => ui::print_success(&format!("{}: no changes", plan.stage)),
                None => ui::print_info(&format!(
                    "{}: planned after the network exists",
                    plan.stage
                )),
            }
        }
        Ok(())
    }
}
