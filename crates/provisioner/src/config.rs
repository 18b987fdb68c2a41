//! Provisioning configuration types.
//!
//! A project file (`eksprov.toml`) declares the remote state descriptor,
//! shared defaults for network, cluster and database, and one table per
//! environment. Environment parameters may be overridden by an input
//! parameter file and by pipeline environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::ClusterSpec;
use crate::database::DatabaseRelease;
use crate::error::{ProvisionError, Result};
use crate::network::NetworkTopology;

/// Default project file name.
pub const DEFAULT_CONFIG_FILE: &str = "eksprov.toml";

/// Default working directory for rendered stacks, run records and leases.
pub const DEFAULT_WORK_DIR: &str = ".eksprov";

/// Provisioning stage that owns a remote state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Network provisioner.
    Network,
    /// Cluster provisioner.
    Cluster,
    /// Database deployer.
    Database,
}

impl Stage {
    /// Stages in provisioning order.
    pub const ALL: [Stage; 3] = [Self::Network, Self::Cluster, Self::Database];

    /// Stages that keep Terraform state.
    pub const TERRAFORM: [Stage; 2] = [Self::Network, Self::Cluster];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::Database => "database",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-environment parameters shared by the network and cluster stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentParams {
    /// Environment name (dev, test, staging, prod).
    pub env_prefix: String,
    /// Kubernetes `MAJOR.MINOR` version.
    pub k8s_version: String,
    /// Cluster name.
    pub cluster_name: String,
    /// Cloud region.
    pub region: String,
}

impl EnvironmentParams {
    /// Validate field formats.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        validate_label("env_prefix", &self.env_prefix, 63)?;
        validate_label("cluster_name", &self.cluster_name, 100)?;

        let version_ok = self
            .k8s_version
            .split_once('.')
            .is_some_and(|(major, minor)| {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
            });
        if !version_ok {
            return Err(ProvisionError::InvalidConfig(format!(
                "k8s_version '{}' must look like MAJOR.MINOR (e.g. 1.28)",
                self.k8s_version
            )));
        }

        let parts: Vec<&str> = self.region.split('-').collect();
        let region_ok = parts.len() >= 3
            && parts.iter().all(|p| !p.is_empty())
            && parts[..parts.len() - 1]
                .iter()
                .all(|p| p.chars().all(|c| c.is_ascii_lowercase()))
            && parts[parts.len() - 1].chars().all(|c| c.is_ascii_digit());
        if !region_ok {
            return Err(ProvisionError::InvalidConfig(format!(
                "region '{}' is not a cloud region name (e.g. eu-west-2)",
                self.region
            )));
        }

        Ok(())
    }
}

fn validate_label(field: &str, value: &str, max_len: usize) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= max_len
        && value.starts_with(|c: char| c.is_ascii_lowercase())
        && !value.ends_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidConfig(format!(
            "{field} '{value}' must be lowercase letters, digits and '-', start with a letter and be at most {max_len} characters"
        )))
    }
}

/// Partial environment parameters, as found in a parameter file or CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentOverrides {
    /// Environment name.
    pub env_prefix: Option<String>,
    /// Kubernetes version.
    pub k8s_version: Option<String>,
    /// Cluster name.
    pub cluster_name: Option<String>,
    /// Cloud region.
    pub region: Option<String>,
}

impl EnvironmentOverrides {
    /// Read an input parameter file of `key = "value"` lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains unknown keys.
    pub fn from_var_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_var_file(&content).map_err(|e| {
            ProvisionError::InvalidConfig(format!("{}: {e}", path.display()))
        })
    }

    fn parse_var_file(content: &str) -> std::result::Result<Self, String> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct VarFile {
            env_prefix: Option<String>,
            k8s_version: Option<String>,
            cluster_name: Option<String>,
            region: Option<String>,
        }

        let vars: VarFile = toml::from_str(content).map_err(|e| e.to_string())?;
        Ok(Self {
            env_prefix: vars.env_prefix,
            k8s_version: vars.k8s_version,
            cluster_name: vars.cluster_name,
            region: vars.region,
        })
    }

    /// Layer `self` over `other`: values set here win.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            env_prefix: self.env_prefix.or(other.env_prefix),
            k8s_version: self.k8s_version.or(other.k8s_version),
            cluster_name: self.cluster_name.or(other.cluster_name),
            region: self.region.or(other.region),
        }
    }

    /// Complete into full parameters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` listing the missing keys.
    pub fn resolve(self) -> Result<EnvironmentParams> {
        let mut missing = Vec::new();
        if self.env_prefix.is_none() {
            missing.push("env_prefix");
        }
        if self.k8s_version.is_none() {
            missing.push("k8s_version");
        }
        if self.cluster_name.is_none() {
            missing.push("cluster_name");
        }
        if self.region.is_none() {
            missing.push("region");
        }
        match (self.env_prefix, self.k8s_version, self.cluster_name, self.region) {
            (Some(env_prefix), Some(k8s_version), Some(cluster_name), Some(region)) => {
                let params = EnvironmentParams {
                    env_prefix,
                    k8s_version,
                    cluster_name,
                    region,
                };
                params.validate()?;
                Ok(params)
            }
            _ => Err(ProvisionError::InvalidConfig(format!(
                "missing environment parameters: {}",
                missing.join(", ")
            ))),
        }
    }
}

impl From<EnvironmentParams> for EnvironmentOverrides {
    fn from(p: EnvironmentParams) -> Self {
        Self {
            env_prefix: Some(p.env_prefix),
            k8s_version: Some(p.k8s_version),
            cluster_name: Some(p.cluster_name),
            region: Some(p.region),
        }
    }
}

/// Remote state descriptor shared by all environments of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Storage bucket. Must exist before the first run.
    pub bucket: Option<String>,
    /// Bucket region.
    pub region: Option<String>,
    /// Prefix under which per-environment keys are derived.
    pub key_prefix: String,
    /// Lock table used by the engine's own state lock.
    pub lock_table: Option<String>,
    /// Server-side encryption of state objects.
    pub encrypt: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            key_prefix: "eksprov".into(),
            lock_table: None,
            encrypt: true,
        }
    }
}

impl StateConfig {
    /// Key prefix owned by one environment. Also names its lease.
    #[must_use]
    pub fn environment_key(&self, env_prefix: &str) -> String {
        let prefix = self.key_prefix.trim_matches('/');
        if prefix.is_empty() {
            env_prefix.to_string()
        } else {
            format!("{prefix}/{env_prefix}")
        }
    }

    /// Resolve the state location of one stage of one environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if no bucket is configured.
    pub fn location(&self, env: &EnvironmentParams, stage: Stage) -> Result<RemoteState> {
        let bucket = self.bucket.clone().ok_or_else(|| {
            ProvisionError::InvalidConfig(
                "remote state bucket is not configured ([state].bucket); it must exist before the first run"
                    .into(),
            )
        })?;
        Ok(RemoteState {
            bucket,
            key: format!("{}/{stage}.tfstate", self.environment_key(&env.env_prefix)),
            region: self.region.clone().unwrap_or_else(|| env.region.clone()),
            lock_table: self.lock_table.clone(),
            encrypt: self.encrypt,
        })
    }
}

/// Where the engine persists one stage's record of created resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Storage bucket.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Bucket region.
    pub region: String,
    /// Engine lock table.
    pub lock_table: Option<String>,
    /// Server-side encryption.
    pub encrypt: bool,
}

impl RemoteState {
    /// Backend settings passed to `terraform init`.
    #[must_use]
    pub fn backend_config(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("bucket".to_string(), self.bucket.clone()),
            ("key".to_string(), self.key.clone()),
            ("region".to_string(), self.region.clone()),
            ("encrypt".to_string(), self.encrypt.to_string()),
        ];
        if let Some(ref table) = self.lock_table {
            pairs.push(("dynamodb_table".to_string(), table.clone()));
        }
        pairs
    }
}

/// Full project configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Remote state descriptor.
    pub state: StateConfig,
    /// Network layout shared by environments.
    pub network: NetworkTopology,
    /// Cluster specification shared by environments.
    pub cluster: ClusterSpec,
    /// Database release shared by environments.
    pub database: DatabaseRelease,
    /// Declared environments by name.
    pub environments: BTreeMap<String, EnvironmentOverrides>,
}

impl ProjectConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            ProvisionError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        debug!(
            path = %path.display(),
            environments = config.environments.len(),
            "Loaded project config"
        );
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No project config, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate cross-environment invariants and every resolvable environment.
    ///
    /// # Errors
    ///
    /// Returns `StateCollision` if two environments would share state, or
    /// the first validation error of any environment.
    pub fn validate(&self) -> Result<()> {
        let mut seen_keys: BTreeMap<String, &str> = BTreeMap::new();
        let mut seen_clusters: BTreeMap<(String, String), &str> = BTreeMap::new();

        for (name, overrides) in &self.environments {
            let Ok(params) = overrides.clone().resolve() else {
                // Incomplete tables are completed later by CLI/env overrides.
                continue;
            };

            let key = self.state.environment_key(&params.env_prefix);
            if let Some(first) = seen_keys.insert(key.clone(), name) {
                return Err(ProvisionError::StateCollision {
                    first: first.to_string(),
                    second: name.clone(),
                    key,
                });
            }

            let cluster = (params.region.clone(), params.cluster_name.clone());
            if let Some(first) = seen_clusters.insert(cluster, name) {
                return Err(ProvisionError::InvalidConfig(format!(
                    "environments '{first}' and '{name}' both declare cluster '{}' in {}",
                    params.cluster_name, params.region
                )));
            }

            self.resolved(params)?;
        }
        Ok(())
    }

    /// Combine shared settings with one environment's parameters and check
    /// the result.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn resolved(&self, params: EnvironmentParams) -> Result<ResolvedEnvironment> {
        params.validate()?;
        self.network.validate(&params.region)?;
        self.cluster.validate()?;
        self.database.validate()?;
        self.cluster
            .serverless_profile
            .ensure_excludes_namespace(&self.database.namespace)?;
        Ok(ResolvedEnvironment {
            params,
            state: self.state.clone(),
            network: self.network.clone(),
            cluster: self.cluster.clone(),
            database: self.database.clone(),
        })
    }

    /// Resolve one environment from its declared table layered under
    /// `overrides`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown and the overrides are
    /// incomplete, or if validation fails.
    pub fn environment(
        &self,
        name: Option<&str>,
        overrides: EnvironmentOverrides,
    ) -> Result<ResolvedEnvironment> {
        let declared = match name {
            Some(name) => match self.environments.get(name) {
                Some(env) => EnvironmentOverrides {
                    env_prefix: env.env_prefix.clone().or_else(|| Some(name.to_string())),
                    ..env.clone()
                },
                None if overrides.env_prefix.is_none() => EnvironmentOverrides {
                    env_prefix: Some(name.to_string()),
                    ..EnvironmentOverrides::default()
                },
                None => EnvironmentOverrides::default(),
            },
            None => EnvironmentOverrides::default(),
        };
        let params = overrides.or(declared).resolve()?;
        self.validate()?;
        let resolved = self.resolved(params)?;

        // Overrides must not point a different cluster at a declared
        // environment's state.
        for (other, declared) in &self.environments {
            if Some(other.as_str()) == name {
                continue;
            }
            if let Ok(other_params) = declared.clone().resolve() {
                let same_prefix = other_params.env_prefix == resolved.params.env_prefix;
                let same_cluster = other_params.cluster_name == resolved.params.cluster_name
                    && other_params.region == resolved.params.region;
                if same_prefix && !same_cluster {
                    return Err(ProvisionError::StateCollision {
                        first: other.clone(),
                        second: name.unwrap_or(&resolved.params.env_prefix).to_string(),
                        key: self.state.environment_key(&resolved.params.env_prefix),
                    });
                }
            }
        }

        Ok(resolved)
    }
}

/// Everything needed to provision one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEnvironment {
    /// Environment parameters.
    pub params: EnvironmentParams,
    /// Remote state descriptor.
    pub state: StateConfig,
    /// Network layout.
    pub network: NetworkTopology,
    /// Cluster specification.
    pub cluster: ClusterSpec,
    /// Database release.
    pub database: DatabaseRelease,
}

impl ResolvedEnvironment {
    /// State location of `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error if no bucket is configured.
    pub fn remote_state(&self, stage: Stage) -> Result<RemoteState> {
        self.state.location(&self.params, stage)
    }

    /// Lease key guarding this environment's state.
    #[must_use]
    pub fn lease_key(&self) -> String {
        self.state.environment_key(&self.params.env_prefix)
    }

    /// Directory for this environment's rendered stacks and run record.
    #[must_use]
    pub fn env_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.params.env_prefix)
    }

    /// Directory of one stage's rendered stack.
    #[must_use]
    pub fn stage_dir(&self, work_dir: &Path, stage: Stage) -> PathBuf {
        self.env_dir(work_dir).join(stage.as_str())
    }

    /// Run-local kubeconfig written by the cluster stage.
    #[must_use]
    pub fn kubeconfig_path(&self, work_dir: &Path) -> PathBuf {
        self.env_dir(work_dir).join("kubeconfig")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> EnvironmentParams {
        EnvironmentParams {
            env_prefix: "dev".into(),
            k8s_version: "1.28".into(),
            cluster_name: "my-test-cluster".into(),
            region: "eu-west-2".into(),
        }
    }

    fn project_with_bucket() -> ProjectConfig {
        ProjectConfig {
            state: StateConfig {
                bucket: Some("tf-state".into()),
                ..StateConfig::default()
            },
            ..ProjectConfig::default()
        }
    }

    #[test]
    fn test_environment_params_validation() {
        dev().validate().unwrap();

        let bad_version = EnvironmentParams {
            k8s_version: "latest".into(),
            ..dev()
        };
        assert!(bad_version.validate().is_err());

        let bad_region = EnvironmentParams {
            region: "europe".into(),
            ..dev()
        };
        assert!(bad_region.validate().is_err());

        let bad_name = EnvironmentParams {
            cluster_name: "My_Cluster".into(),
            ..dev()
        };
        assert!(bad_name.validate().is_err());

        let gov = EnvironmentParams {
            region: "us-gov-west-1".into(),
            ..dev()
        };
        gov.validate().unwrap();
    }

    #[test]
    fn test_var_file_parsing() {
        let vars = EnvironmentOverrides::parse_var_file(
            r#"
env_prefix   = "dev"
k8s_version  = "1.28"
cluster_name = "my-test-cluster"
region       = "eu-west-2"
"#,
        )
        .unwrap();
        assert_eq!(vars.resolve().unwrap(), dev());

        assert!(EnvironmentOverrides::parse_var_file("unknown = \"x\"").is_err());
    }

    #[test]
    fn test_overrides_precedence() {
        let file = EnvironmentOverrides::from(dev());
        let cli = EnvironmentOverrides {
            k8s_version: Some("1.29".into()),
            ..EnvironmentOverrides::default()
        };
        let params = cli.or(file).resolve().unwrap();
        assert_eq!(params.k8s_version, "1.29");
        assert_eq!(params.cluster_name, "my-test-cluster");
    }

    #[test]
    fn test_resolve_reports_missing_keys() {
        let err = EnvironmentOverrides {
            env_prefix: Some("dev".into()),
            ..EnvironmentOverrides::default()
        }
        .resolve()
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("k8s_version"));
        assert!(msg.contains("cluster_name"));
        assert!(msg.contains("region"));
        assert!(!msg.contains("env_prefix"));
    }

    #[test]
    fn test_state_keys_are_unique_per_environment() {
        let state = project_with_bucket().state;
        let dev = dev();
        let prod = EnvironmentParams {
            env_prefix: "prod".into(),
            ..dev.clone()
        };

        let dev_net = state.location(&dev, Stage::Network).unwrap();
        let dev_cluster = state.location(&dev, Stage::Cluster).unwrap();
        let prod_net = state.location(&prod, Stage::Network).unwrap();

        assert_eq!(dev_net.key, "eksprov/dev/network.tfstate");
        assert_eq!(dev_cluster.key, "eksprov/dev/cluster.tfstate");
        assert_eq!(prod_net.key, "eksprov/prod/network.tfstate");
        assert_eq!(dev_net.region, "eu-west-2");
    }

    #[test]
    fn test_missing_bucket_is_configuration_error() {
        let state = StateConfig::default();
        let err = state.location(&dev(), Stage::Network).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);
    }

    #[test]
    fn test_backend_config_includes_lock_table() {
        let remote = RemoteState {
            bucket: "b".into(),
            key: "k".into(),
            region: "eu-west-2".into(),
            lock_table: Some("locks".into()),
            encrypt: true,
        };
        let pairs = remote.backend_config();
        assert!(pairs.contains(&("dynamodb_table".into(), "locks".into())));
        assert!(pairs.contains(&("encrypt".into(), "true".into())));
    }

    #[test]
    fn test_project_rejects_colliding_environments() {
        let mut project = project_with_bucket();
        project
            .environments
            .insert("dev".into(), EnvironmentOverrides::from(dev()));
        project.environments.insert(
            "dev-copy".into(),
            EnvironmentOverrides::from(EnvironmentParams {
                cluster_name: "other".into(),
                ..dev()
            }),
        );
        let err = project.validate().unwrap_err();
        assert!(matches!(err, ProvisionError::StateCollision { .. }));
    }

    #[test]
    fn test_project_environment_lookup() {
        let mut project = project_with_bucket();
        project
            .environments
            .insert("dev".into(), EnvironmentOverrides::from(dev()));

        let resolved = project
            .environment(Some("dev"), EnvironmentOverrides::default())
            .unwrap();
        assert_eq!(resolved.params, dev());
        assert_eq!(resolved.lease_key(), "eksprov/dev");
        assert_eq!(
            resolved.stage_dir(Path::new("/w"), Stage::Cluster),
            PathBuf::from("/w/dev/cluster")
        );
    }

    #[test]
    fn test_override_cannot_reuse_declared_env_prefix() {
        let mut project = project_with_bucket();
        project
            .environments
            .insert("prod".into(), EnvironmentOverrides::from(EnvironmentParams {
                env_prefix: "prod".into(),
                cluster_name: "prod-cluster".into(),
                ..dev()
            }));

        let overrides = EnvironmentOverrides {
            env_prefix: Some("prod".into()),
            ..EnvironmentOverrides::from(dev())
        };
        let err = project.environment(Some("staging"), overrides).unwrap_err();
        assert!(matches!(err, ProvisionError::StateCollision { .. }));
    }

    #[test]
    fn test_project_toml_round_trip_of_defaults() {
        let project: ProjectConfig = toml::from_str(
            r#"
[state]
bucket = "tf-state"
lock_table = "tf-locks"

[environments.dev]
env_prefix = "dev"
k8s_version = "1.28"
cluster_name = "my-test-cluster"
region = "eu-west-2"
"#,
        )
        .unwrap();
        assert_eq!(project.state.key_prefix, "eksprov");
        assert_eq!(project.cluster.worker_count, 3);
        assert_eq!(project.database.replicas, 3);
        project.validate().unwrap();
    }
}
