//! EKS environment provisioning library.
//!
//! Provisions one environment at a time: a network, a managed Kubernetes
//! cluster inside it, and a replicated database release inside the cluster.
//! Resource creation is delegated to Terraform, Helm and the AWS CLI; this
//! library owns parameters, stage ordering, environment isolation, the
//! state lease and the readiness gates.
//!
//! # Example
//!
//! ```ignore
//! use eksprov::{EnvironmentOverrides, ProjectConfig, Provisioner, RunOptions, Toolchain};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let project = ProjectConfig::load("eksprov.toml".as_ref())?;
//!     let env = project.environment(Some("dev"), EnvironmentOverrides::default())?;
//!     let tools = Toolchain::system(&env, None);
//!     let summary = Provisioner::new(env, ".eksprov", tools)
//!         .run(&RunOptions::default())
//!         .await?;
//!     println!("{}", summary.cluster.cluster_endpoint);
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod database;
pub mod engine;
pub mod error;
pub mod helm;
pub mod kubeconfig;
pub mod lease;
pub mod network;
pub mod orchestrator;
pub mod outputs;
pub mod process;
pub mod readiness;
pub mod stack;
pub mod state;
pub mod ui;
pub mod validator;

// Re-export commonly used types at the crate root
pub use config::{EnvironmentOverrides, EnvironmentParams, ProjectConfig, ResolvedEnvironment, Stage};
pub use error::{ErrorClass, ProvisionError};
pub use orchestrator::{FailurePolicy, Provisioner, RunOptions, RunSummary, Toolchain};
pub use state::{PipelinePhase, PipelineRun, PipelineStep};
