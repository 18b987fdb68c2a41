//! Prerequisite checks for the external tools each command drives.

use std::path::PathBuf;

use colored::Colorize;

use crate::error::{ProvisionError, Result};
use crate::ui;

/// A required external tool.
struct Requirement {
    binary: &'static str,
    install_instructions: &'static str,
}

const TERRAFORM: Requirement = Requirement {
    binary: "terraform",
    install_instructions: "Install Terraform >= 1.3 from https://developer.hashicorp.com/terraform/install",
};
const AWS: Requirement = Requirement {
    binary: "aws",
    install_instructions: "Install AWS CLI v2 from https://aws.amazon.com/cli/",
};
const HELM: Requirement = Requirement {
    binary: "helm",
    install_instructions: "Install Helm from https://helm.sh/docs/intro/install/",
};

/// Validates that required tools are on `PATH`.
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

impl PrerequisitesValidator {
    /// Tools needed to render and plan stacks.
    #[must_use]
    pub fn engine_only() -> Self {
        Self {
            requirements: vec![TERRAFORM],
        }
    }

    /// Tools needed for a full provisioning run.
    #[must_use]
    pub fn full() -> Self {
        Self {
            requirements: vec![TERRAFORM, AWS, HELM],
        }
    }

    /// Tools needed to query the cloud API.
    #[must_use]
    pub fn cloud_only() -> Self {
        Self {
            requirements: vec![AWS],
        }
    }

    /// Names of the required tools.
    #[must_use]
    pub fn tools(&self) -> Vec<&'static str> {
        self.requirements.iter().map(|r| r.binary).collect()
    }

    /// Locate each tool and print the result.
    ///
    /// # Errors
    ///
    /// Returns `MissingTool` for the first tool not found.
    pub fn validate(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for requirement in &self.requirements {
            match which::which(requirement.binary) {
                Ok(path) => {
                    ui::print_check_result(
                        requirement.binary,
                        true,
                        Some(&path.display().to_string()),
                    );
                    found.push(path);
                }
                Err(_) => {
                    ui::print_check_result(requirement.binary, false, None);
                    missing.push(requirement);
                }
            }
        }

        if let Some(first) = missing.first() {
            println!();
            for failure in &missing {
                println!(
                    "  {} {} - {}",
                    "✗".red(),
                    failure.binary.red(),
                    failure.install_instructions.bright_black()
                );
            }
            return Err(ProvisionError::MissingTool(first.binary.to_string()));
        }
        Ok(found)
    }
}
