use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use eksprov::credentials::PipelineCredentials;
use eksprov::orchestrator::print_run_summary;
use eksprov::ui;
use eksprov::validator::PrerequisitesValidator;
use eksprov::{FailurePolicy, RunOptions};

use super::GlobalArgs;

/// Run every stage non-interactively and publish the cluster endpoint
#[derive(Args, Debug)]
pub struct PipelineCommand {
    /// What to do with stages this run created if a stage fails (halt, destroy)
    #[arg(long, value_name = "POLICY", default_value = "halt")]
    on_failure: FailurePolicy,

    /// File to append output variables to (defaults to $GITHUB_OUTPUT)
    #[arg(long, value_name = "FILE")]
    output_file: Option<PathBuf>,
}

impl PipelineCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        ui::print_banner();
        ui::print_section("Pipeline run");

        let credentials =
            PipelineCredentials::from_env().context("Pipeline credentials are not injected")?;
        tracing::info!(credentials = ?credentials, "Using injected credentials");

        PrerequisitesValidator::full().validate()?;
        let provisioner = global.provisioner(Some(&credentials))?;
        let options = RunOptions {
            failure_policy: self.on_failure,
            configure_access: true,
            output_file: self.output_file.clone(),
        };
        let summary = provisioner.run(&options).await?;
        print_run_summary(&summary, provisioner.environment());
        Ok(())
    }
}
