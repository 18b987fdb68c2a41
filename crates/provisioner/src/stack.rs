//! Terraform stack rendering.
//!
//! Each Terraform-backed stage is a root module written in Terraform's JSON
//! syntax (`main.tf.json`). The network stack wraps the community VPC
//! module, the cluster stack wraps the community EKS module and consumes the
//! network stack's outputs. Both use a partially configured S3 backend whose
//! bucket and key are supplied at `init` time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ResolvedEnvironment, Stage};
use crate::error::{ProvisionError, Result};
use crate::network::{ownership_tags, private_subnet_tags, public_subnet_tags, NatMode};

/// Rendered root module file name.
pub const STACK_FILE: &str = "main.tf.json";

/// Pinned module sources.
const VPC_MODULE: &str = "terraform-aws-modules/vpc/aws";
const VPC_MODULE_VERSION: &str = "5.1.2";
const EKS_MODULE: &str = "terraform-aws-modules/eks/aws";
const EKS_MODULE_VERSION: &str = "19.15.3";

/// Outputs of the network stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOutputs {
    /// VPC identifier.
    pub vpc_id: String,
    /// Private subnet identifiers.
    pub private_subnets: Vec<String>,
    /// Public subnet identifiers.
    pub public_subnets: Vec<String>,
}

/// Outputs of the cluster stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutputs {
    /// API server endpoint URL.
    pub cluster_endpoint: String,
    /// Cluster name as created.
    pub cluster_name: String,
    /// Base64 CA bundle.
    #[serde(default)]
    pub cluster_certificate_authority_data: String,
    /// Serverless profile names.
    #[serde(default)]
    pub fargate_profile_names: Vec<String>,
}

/// Raw `terraform output -json` document.
pub type RawOutputs = BTreeMap<String, OutputValue>;

/// One entry of `terraform output -json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputValue {
    /// Output value.
    pub value: Value,
    /// Whether the output is marked sensitive.
    #[serde(default)]
    pub sensitive: bool,
}

fn take_output<T: serde::de::DeserializeOwned>(
    raw: &RawOutputs,
    stage: Stage,
    name: &str,
) -> Result<T> {
    let value = raw
        .get(name)
        .ok_or_else(|| ProvisionError::MissingOutput {
            stage: stage.to_string(),
            name: name.to_string(),
        })?
        .value
        .clone();
    Ok(serde_json::from_value(value)?)
}

impl NetworkOutputs {
    /// Extract from engine outputs.
    ///
    /// # Errors
    ///
    /// Returns `MissingOutput` if an expected output is absent.
    pub fn from_raw(raw: &RawOutputs) -> Result<Self> {
        Ok(Self {
            vpc_id: take_output(raw, Stage::Network, "vpc_id")?,
            private_subnets: take_output(raw, Stage::Network, "private_subnets")?,
            public_subnets: take_output(raw, Stage::Network, "public_subnets")?,
        })
    }
}

impl ClusterOutputs {
    /// Extract from engine outputs.
    ///
    /// # Errors
    ///
    /// Returns `MissingOutput` if the endpoint or name is absent.
    pub fn from_raw(raw: &RawOutputs) -> Result<Self> {
        Ok(Self {
            cluster_endpoint: take_output(raw, Stage::Cluster, "cluster_endpoint")?,
            cluster_name: take_output(raw, Stage::Cluster, "cluster_name")?,
            cluster_certificate_authority_data: take_output(
                raw,
                Stage::Cluster,
                "cluster_certificate_authority_data",
            )
            .unwrap_or_default(),
            fargate_profile_names: take_output(raw, Stage::Cluster, "fargate_profile_names")
                .unwrap_or_default(),
        })
    }
}

fn terraform_block() -> Value {
    json!({
        "required_version": ">= 1.3",
        "required_providers": {
            "aws": { "source": "hashicorp/aws", "version": "~> 5.0" }
        },
        "backend": { "s3": {} }
    })
}

fn provider_block(env: &ResolvedEnvironment) -> Value {
    json!({
        "aws": {
            "region": env.params.region,
            "default_tags": { "tags": ownership_tags(&env.params) }
        }
    })
}

/// Render the network root module.
#[must_use]
pub fn render_network(env: &ResolvedEnvironment) -> Value {
    let params = &env.params;
    let topology = &env.network;
    let to_strings = |blocks: &[crate::network::Ipv4Cidr]| -> Vec<String> {
        blocks.iter().map(ToString::to_string).collect()
    };

    json!({
        "terraform": terraform_block(),
        "provider": provider_block(env),
        "module": {
            "vpc": {
                "source": VPC_MODULE,
                "version": VPC_MODULE_VERSION,
                "name": format!("{}-{}-vpc", params.env_prefix, params.cluster_name),
                "cidr": topology.cidr.to_string(),
                "azs": topology.zones_for(&params.region),
                "private_subnets": to_strings(&topology.private_subnets),
                "public_subnets": to_strings(&topology.public_subnets),
                "enable_nat_gateway": topology.nat != NatMode::None,
                "single_nat_gateway": topology.nat == NatMode::Single,
                "one_nat_gateway_per_az": topology.nat == NatMode::OnePerAz,
                "enable_dns_hostnames": true,
                "tags": ownership_tags(params),
                "public_subnet_tags": public_subnet_tags(params),
                "private_subnet_tags": private_subnet_tags(params)
            }
        },
        "output": {
            "vpc_id": { "value": "${module.vpc.vpc_id}" },
            "vpc_cidr_block": { "value": "${module.vpc.vpc_cidr_block}" },
            "private_subnets": { "value": "${module.vpc.private_subnets}" },
            "public_subnets": { "value": "${module.vpc.public_subnets}" }
        }
    })
}

/// Render the cluster root module, wired to the network stage's outputs.
#[must_use]
pub fn render_cluster(env: &ResolvedEnvironment, network: &NetworkOutputs) -> Value {
    let params = &env.params;
    let spec = &env.cluster;
    let profile = &spec.serverless_profile;

    let selectors: Vec<Value> = profile
        .selectors
        .iter()
        .map(|s| {
            if s.labels.is_empty() {
                json!({ "namespace": s.namespace })
            } else {
                json!({ "namespace": s.namespace, "labels": s.labels })
            }
        })
        .collect();

    json!({
        "terraform": terraform_block(),
        "provider": provider_block(env),
        "module": {
            "eks": {
                "source": EKS_MODULE,
                "version": EKS_MODULE_VERSION,
                "cluster_name": params.cluster_name,
                "cluster_version": params.k8s_version,
                "cluster_endpoint_public_access": true,
                "vpc_id": network.vpc_id,
                "subnet_ids": network.private_subnets,
                "eks_managed_node_groups": {
                    "workers": {
                        "min_size": spec.worker_count,
                        "max_size": spec.worker_count,
                        "desired_size": spec.worker_count,
                        "instance_types": [spec.instance_type]
                    }
                },
                "fargate_profiles": {
                    (profile.name.clone()): {
                        "name": profile.name,
                        "selectors": selectors
                    }
                },
                "tags": ownership_tags(params)
            }
        },
        "output": {
            "cluster_endpoint": { "value": "${module.eks.cluster_endpoint}" },
            "cluster_name": { "value": "${module.eks.cluster_name}" },
            "cluster_certificate_authority_data": {
                "value": "${module.eks.cluster_certificate_authority_data}"
            },
            "fargate_profile_names": {
                "value": "${[for p in module.eks.fargate_profiles : p.fargate_profile_name]}"
            }
        }
    })
}

/// Render the cluster root module wired to input variables instead of
/// network outputs, for use before the network exists.
///
/// The variables default to empty values so the module stays valid for
/// `init`, `output` and `destroy` against an empty or partial state. It is
/// not meant to be applied.
#[must_use]
pub fn render_cluster_detached(env: &ResolvedEnvironment) -> Value {
    let network = NetworkOutputs {
        vpc_id: "${var.vpc_id}".into(),
        private_subnets: vec!["${var.private_subnet_id}".into()],
        public_subnets: Vec::new(),
    };
    let mut stack = render_cluster(env, &network);
    stack["variable"] = json!({
        "vpc_id": { "type": "string", "default": "" },
        "private_subnet_id": { "type": "string", "default": "" }
    });
    stack
}

/// Write a rendered stack into `dir`, returning the file path.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn write_stack(dir: &Path, stack: &Value) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(STACK_FILE);
    let content = serde_json::to_string_pretty(stack)?;
    std::fs::write(&path, content)?;
    debug!(path = %path.display(), "Wrote stack");
    Ok(path)
}
