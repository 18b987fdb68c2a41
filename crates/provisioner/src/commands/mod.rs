//! CLI subcommands.

pub mod apply;
pub mod destroy;
pub mod init;
pub mod kubeconfig;
pub mod pipeline;
pub mod plan;
pub mod profiles;
pub mod render;
pub mod status;
pub mod verify;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use eksprov::config::{EnvironmentOverrides, ProjectConfig, ResolvedEnvironment};
use eksprov::credentials::PipelineCredentials;
use eksprov::{Provisioner, Toolchain};

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Project configuration file
    #[arg(long, global = true, value_name = "FILE", default_value = eksprov::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Declared environment to operate on
    #[arg(long = "env", global = true, value_name = "NAME", env = "EKSPROV_ENV")]
    pub environment: Option<String>,

    /// Directory for rendered stacks, run records and leases
    #[arg(long, global = true, value_name = "DIR", default_value = eksprov::config::DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    /// Input parameter file (key = "value" lines)
    #[arg(long, global = true, value_name = "FILE")]
    pub var_file: Option<PathBuf>,

    /// Environment name override
    #[arg(long, global = true, env = "TF_VAR_env_prefix")]
    pub env_prefix: Option<String>,

    /// Kubernetes version override (MAJOR.MINOR)
    #[arg(long, global = true, env = "TF_VAR_k8s_version")]
    pub k8s_version: Option<String>,

    /// Cluster name override
    #[arg(long, global = true, env = "TF_VAR_cluster_name")]
    pub cluster_name: Option<String>,

    /// Region override
    #[arg(long, global = true, env = "TF_VAR_region")]
    pub region: Option<String>,
}

impl GlobalArgs {
    /// Load the project file.
    pub fn project(&self) -> Result<ProjectConfig> {
        ProjectConfig::load_or_default(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))
    }

    /// Resolve the target environment from project file, parameter file and
    /// flags, in increasing precedence.
    pub fn resolve(&self) -> Result<ResolvedEnvironment> {
        let project = self.project()?;
        let flags = EnvironmentOverrides {
            env_prefix: self.env_prefix.clone(),
            k8s_version: self.k8s_version.clone(),
            cluster_name: self.cluster_name.clone(),
            region: self.region.clone(),
        };
        let overrides = match self.var_file {
            Some(ref path) => flags.or(EnvironmentOverrides::from_var_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?),
            None => flags,
        };
        project
            .environment(self.environment.as_deref(), overrides)
            .context("Invalid environment parameters")
    }

    /// Provisioner for the resolved environment using the system tools.
    pub fn provisioner(&self, credentials: Option<&PipelineCredentials>) -> Result<Provisioner> {
        let env = self.resolve()?;
        let tools = Toolchain::system(&env, credentials);
        Ok(Provisioner::new(env, &self.work_dir, tools))
    }
}
