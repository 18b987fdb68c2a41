use anyhow::{Context, Result};
use clap::Args;

use eksprov::ui;

use super::GlobalArgs;

/// Write the stacks and chart values without running anything
#[derive(Args, Debug)]
pub struct RenderCommand {}

impl RenderCommand {
    pub fn run(&self, global: &GlobalArgs) -> Result<()> {
        let provisioner = global.provisioner(None)?;
        let files = provisioner.render().context("Failed to render stacks")?;
        for file in &files {
            ui::print_success(&format!("Wrote {}", file.display()));
        }
        Ok(())
    }
}
