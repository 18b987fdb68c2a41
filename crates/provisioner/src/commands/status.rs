use anyhow::Result;
use clap::Args;

use eksprov::lease::{FileLeaseStore, LeaseStore};
use eksprov::ui;

use super::GlobalArgs;

/// Show the last recorded run of an environment
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// Print the raw run record as JSON
    #[arg(long)]
    json: bool,
}

impl StatusCommand {
    pub fn run(&self, global: &GlobalArgs) -> Result<()> {
        let provisioner = global.provisioner(None)?;
        let env = provisioner.environment();

        let Some(run) = provisioner.last_run()? else {
            ui::print_info(&format!(
                "No runs recorded for environment '{}'",
                env.params.env_prefix
            ));
            return Ok(());
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&run)?);
            return Ok(());
        }

        ui::print_section(&format!("Environment '{}'", env.params.env_prefix));
        ui::print_kv("Run", &run.run_id);
        ui::print_kv("Phase", &run.phase().to_string());
        ui::print_kv("Step", &run.step.to_string());
        if let Some(step) = run.failed_step {
            ui::print_kv("Failed at", &step.to_string());
        }
        ui::print_kv("Started", &run.started_at.to_rfc3339());
        ui::print_kv("Updated", &run.updated_at.to_rfc3339());
        let stages = |list: &[eksprov::Stage]| {
            list.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        };
        ui::print_kv("Created stages", &stages(&run.created_stages));
        ui::print_kv("Completed stages", &stages(&run.completed_stages));
        if !run.rolled_back.is_empty() {
            ui::print_kv("Rolled back", &stages(&run.rolled_back));
        }
        if let Some(ref cluster) = run.cluster {
            ui::print_kv("Endpoint", &cluster.cluster_endpoint);
        }
        if let Some(ref report) = run.database {
            ui::print_kv("Database", &report.to_string());
        }
        if let Some(ref err) = run.last_error {
            ui::print_error(err);
        }

        let leases = FileLeaseStore::new(global.work_dir.join("leases"));
        match leases.current(&env.lease_key())? {
            Some(lease) => ui::print_warning(&format!(
                "Locked by {} (run {}) until {}",
                lease.holder,
                lease.run_id,
                lease.expires_at().to_rfc3339()
            )),
            None => ui::print_kv("Lease", "free"),
        }
        Ok(())
    }
}
