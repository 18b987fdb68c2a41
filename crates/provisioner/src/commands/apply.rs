use anyhow::Result;
use clap::Args;

use eksprov::orchestrator::print_run_summary;
use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;
use eksprov::{FailurePolicy, RunOptions};

use super::GlobalArgs;

/// Converge network, cluster and database for an environment
#[derive(Args, Debug)]
pub struct ApplyCommand {
    /// What to do with stages this run created if a stage fails (halt, destroy)
    #[arg(long, value_name = "POLICY", default_value = "halt")]
    on_failure: FailurePolicy,
}

impl ApplyCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_banner();
        ui::print_section("Applying environment");

        PrerequisitesValidator::full().validate()?;
        let provisioner = global.provisioner(None)?;
        let options = RunOptions {
            failure_policy: self.on_failure,
            configure_access: false,
            output_file: None,
        };
        let summary = provisioner.run(&options).await?;
        print_run_summary(&summary, provisioner.environment());
        Ok(())
    }
}
