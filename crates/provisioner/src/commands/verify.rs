use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;

use eksprov::cluster::Workload;
use eksprov::database::INSTANCE_LABEL;
use eksprov::ui;

use super::GlobalArgs;

/// Check serverless profile scoping and database readiness
#[derive(Args, Debug)]
pub struct VerifyCommand {
    /// Workload to check against the serverless profile (ns[:key=value,...]); repeatable
    #[arg(long = "workload", value_name = "WORKLOAD")]
    workloads: Vec<Workload>,

    /// Only run the offline profile checks
    #[arg(long)]
    offline: bool,
}

impl VerifyCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let provisioner = global.provisioner(None)?;
        let env = provisioner.environment();
        let profile = &env.cluster.serverless_profile;

        ui::print_section(&format!("Serverless profile '{}'", profile.name));
        for selector in &profile.selectors {
            let labels: Vec<String> = selector
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            ui::print_kv("Selector", &format!("{} [{}]", selector.namespace, labels.join(",")));
        }
        let database = Workload {
            namespace: env.database.namespace.clone(),
            labels: BTreeMap::from([(
                INSTANCE_LABEL.to_string(),
                env.database.release_name.clone(),
            )]),
        };
        for workload in self.workloads.iter().chain(std::iter::once(&database)) {
            let admitted = profile.admits(workload);
            ui::print_check_result(
                &workload.to_string(),
                true,
                Some(if admitted {
                    "runs on the serverless profile"
                } else {
                    "runs on managed workers"
                }),
            );
        }
        if profile.admits(&database) {
            anyhow::bail!(
                "Database pods would be scheduled on serverless capacity, which cannot mount their volumes"
            );
        }

        if self.offline {
            return Ok(());
        }

        ui::print_section(&format!("Database release '{}'", env.database.release_name));
        let report = provisioner
            .verify_database()
            .await
            .context("Failed to read database readiness")?;
        ui::print_readiness(&report);
        if !report.is_ready() {
            return Err(report.to_error().into());
        }
        Ok(())
    }
}
