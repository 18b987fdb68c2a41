//! Cloud API access through the `aws` command-line client.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::Stage;
use crate::credentials::PipelineCredentials;
use crate::engine::{classify_failure, with_retry, FailureContext};
use crate::error::Result;
use crate::network::ExistingVpc;
use crate::process::{display_command, run_tool};
use crate::state::RetryConfig;

/// Cloud queries and cluster access used around the engine stages.
#[async_trait]
pub trait CloudAccess: Send + Sync {
    /// VPCs already present in `region`.
    async fn describe_vpcs(&self, region: &str) -> Result<Vec<ExistingVpc>>;

    /// Write access for `cluster` into `kubeconfig`, or into the operator's
    /// default configuration when `None`.
    async fn update_kubeconfig(
        &self,
        cluster: &str,
        region: &str,
        kubeconfig: Option<&Path>,
    ) -> Result<()>;

    /// Serverless profile names the control plane holds for `cluster`.
    async fn list_fargate_profiles(&self, cluster: &str, region: &str) -> Result<Vec<String>>;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcs {
    #[serde(default)]
    vpcs: Vec<ExistingVpc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFargateProfiles {
    #[serde(default)]
    fargate_profile_names: Vec<String>,
}

/// `aws` command-line adapter.
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    env: Vec<(&'static str, String)>,
    retry: RetryConfig,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self {
            binary: "aws".into(),
            env: vec![("AWS_PAGER", String::new())],
            retry: RetryConfig::default(),
        }
    }
}

impl AwsCli {
    /// Inject credentials into every invocation.
    #[must_use]
    pub fn with_credentials(mut self, credentials: &PipelineCredentials) -> Self {
        self.env.extend(credentials.env_pairs());
        self
    }

    async fn run(&self, stage: Stage, args: Vec<String>) -> Result<String> {
        let command = display_command(&self.binary, &args);
        with_retry(&self.retry, &command, || async {
            let out = run_tool(&self.binary, &args, None, &self.env).await?;
            if out.success() {
                Ok(out.stdout)
            } else {
                Err(classify_failure(
                    stage,
                    &command,
                    &out.stderr,
                    &FailureContext::default(),
                ))
            }
        })
        .await
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl CloudAccess for AwsCli {
    async fn describe_vpcs(&self, region: &str) -> Result<Vec<ExistingVpc>> {
        let stdout = self
            .run(
                Stage::Network,
                args(&["ec2", "describe-vpcs", "--region", region, "--output", "json"]),
            )
            .await?;
        let parsed: DescribeVpcs = serde_json::from_str(&stdout)?;
        Ok(parsed.vpcs)
    }

    async fn update_kubeconfig(
        &self,
        cluster: &str,
        region: &str,
        kubeconfig: Option<&Path>,
    ) -> Result<()> {
        let mut argv = args(&["eks", "update-kubeconfig", "--name", cluster, "--region", region]);
        if let Some(path) = kubeconfig {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            argv.push("--kubeconfig".into());
            argv.push(path.display().to_string());
        }
        self.run(Stage::Cluster, argv).await?;
        info!(
            cluster,
            target = %kubeconfig.map_or_else(|| "default".to_string(), |p| p.display().to_string()),
            "Updated kubeconfig"
        );
        Ok(())
    }

    async fn list_fargate_profiles(&self, cluster: &str, region: &str) -> Result<Vec<String>> {
        let stdout = self
            .run(
                Stage::Cluster,
                args(&[
                    "eks",
                    "list-fargate-profiles",
                    "--cluster-name",
                    cluster,
                    "--region",
                    region,
                    "--output",
                    "json",
                ]),
            )
            .await?;
        let parsed: ListFargateProfiles = serde_json::from_str(&stdout)?;
        Ok(parsed.fargate_profile_names)
    }
}
