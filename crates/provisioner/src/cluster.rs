//! Managed cluster specification.
//!
//! A fixed-size managed worker group plus exactly one serverless (Fargate)
//! capacity profile. The profile must stay scoped to the workload it was
//! created for: its selectors name a concrete namespace and never open up
//! the cluster's system namespaces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Namespaces a label-less selector must never claim.
const PROTECTED_NAMESPACES: [&str; 2] = ["default", "kube-system"];

/// Cluster specification shared by environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Managed worker node count (min = max = desired).
    pub worker_count: u32,
    /// Worker instance type.
    pub instance_type: String,
    /// Serverless capacity profile.
    pub serverless_profile: ServerlessProfile,
    /// Seconds to wait for workers to register.
    pub ready_timeout_secs: u64,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            worker_count: 3,
            instance_type: "t3.medium".into(),
            serverless_profile: ServerlessProfile::default(),
            ready_timeout_secs: 900,
        }
    }
}

impl ClusterSpec {
    /// Validate sizing and profile scoping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the problem.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ProvisionError::InvalidConfig(
                "cluster.worker_count must be at least 1".into(),
            ));
        }
        if self.instance_type.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "cluster.instance_type must not be empty".into(),
            ));
        }
        self.serverless_profile.validate()
    }
}

/// A workload selector of a serverless profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSelector {
    /// Namespace the workload must run in.
    pub namespace: String,
    /// Labels the workload must carry.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Serverless capacity profile reserved for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerlessProfile {
    /// Profile name.
    pub name: String,
    /// Selectors; a workload matching any of them is admitted.
    pub selectors: Vec<ProfileSelector>,
}

impl Default for ServerlessProfile {
    fn default() -> Self {
        Self {
            name: "app".into(),
            selectors: vec![ProfileSelector {
                namespace: "app".into(),
                labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            }],
        }
    }
}

impl ServerlessProfile {
    /// Check the profile is scoped to a named workload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the profile could admit arbitrary workloads.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "serverless profile needs a name".into(),
            ));
        }
        if self.selectors.is_empty() {
            return Err(ProvisionError::InvalidConfig(format!(
                "serverless profile '{}' has no selectors",
                self.name
            )));
        }
        for selector in &self.selectors {
            if selector.namespace.trim().is_empty() {
                return Err(ProvisionError::InvalidConfig(format!(
                    "serverless profile '{}' has a selector without a namespace",
                    self.name
                )));
            }
            if selector.namespace.contains(['*', '?']) {
                return Err(ProvisionError::InvalidConfig(format!(
                    "serverless profile '{}' uses wildcard namespace '{}'",
                    self.name, selector.namespace
                )));
            }
            if selector.labels.is_empty()
                && PROTECTED_NAMESPACES.contains(&selector.namespace.as_str())
            {
                return Err(ProvisionError::InvalidConfig(format!(
                    "serverless profile '{}' would admit every workload in '{}'",
                    self.name, selector.namespace
                )));
            }
        }
        Ok(())
    }

    /// Whether the scheduler would place `workload` on this profile.
    #[must_use]
    pub fn admits(&self, workload: &Workload) -> bool {
        self.selectors.iter().any(|selector| {
            selector.namespace == workload.namespace
                && selector
                    .labels
                    .iter()
                    .all(|(k, v)| workload.labels.get(k) == Some(v))
        })
    }

    /// Ensure no workload in `namespace` can land on the profile.
    ///
    /// Serverless pods cannot mount the block volumes the database needs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a selector targets `namespace`.
    pub fn ensure_excludes_namespace(&self, namespace: &str) -> Result<()> {
        if self.selectors.iter().any(|s| s.namespace == namespace) {
            return Err(ProvisionError::InvalidConfig(format!(
                "serverless profile '{}' selects namespace '{namespace}', which hosts persistent workloads",
                self.name
            )));
        }
        Ok(())
    }
}

/// A workload identity as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Workload {
    /// Namespace.
    pub namespace: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
}

impl std::str::FromStr for Workload {
    type Err = ProvisionError;

    /// Parse `namespace[:key=value,key=value]`.
    fn from_str(s: &str) -> Result<Self> {
        let (namespace, labels) = s.split_once(':').unwrap_or((s, ""));
        if namespace.is_empty() {
            return Err(ProvisionError::InvalidConfig(format!(
                "workload '{s}' has no namespace"
            )));
        }
        let labels = labels
            .split(',')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        ProvisionError::InvalidConfig(format!(
                            "label '{pair}' in workload '{s}' is not key=value"
                        ))
                    })
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            namespace: namespace.to_string(),
            labels,
        })
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        if !self.labels.is_empty() {
            let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, ":{}", labels.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec() {
        let spec = ClusterSpec::default();
        assert_eq!(spec.worker_count, 3);
        assert_eq!(spec.serverless_profile.selectors.len(), 1);
        spec.validate().unwrap();
    }

    #[test]
    fn test_profile_admits_matching_workload() {
        let profile = ServerlessProfile::default();
        let web: Workload = "app:app=web,tier=frontend".parse().unwrap();
        assert!(profile.admits(&web));
    }

    #[test]
    fn test_profile_rejects_unrelated_workloads() {
        let profile = ServerlessProfile::default();

        let other_ns: Workload = "batch:app=web".parse().unwrap();
        assert!(!profile.admits(&other_ns));

        let missing_label: Workload = "app".parse().unwrap();
        assert!(!profile.admits(&missing_label));

        let wrong_value: Workload = "app:app=worker".parse().unwrap();
        assert!(!profile.admits(&wrong_value));
    }

    #[test]
    fn test_validate_rejects_unscoped_profiles() {
        let empty = ServerlessProfile {
            name: "app".into(),
            selectors: vec![],
        };
        assert!(empty.validate().is_err());

        let wildcard = ServerlessProfile {
            name: "app".into(),
            selectors: vec![ProfileSelector {
                namespace: "*".into(),
                labels: BTreeMap::new(),
            }],
        };
        assert!(wildcard.validate().is_err());

        let system = ServerlessProfile {
            name: "app".into(),
            selectors: vec![ProfileSelector {
                namespace: "kube-system".into(),
                labels: BTreeMap::new(),
            }],
        };
        assert!(system.validate().is_err());

        let labelled_default = ServerlessProfile {
            name: "app".into(),
            selectors: vec![ProfileSelector {
                namespace: "default".into(),
                labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            }],
        };
        labelled_default.validate().unwrap();
    }

    #[test]
    fn test_excludes_database_namespace() {
        let profile = ServerlessProfile::default();
        profile.ensure_excludes_namespace("database").unwrap();
        assert!(profile.ensure_excludes_namespace("app").is_err());
    }

    #[test]
    fn test_workload_parsing() {
        let w: Workload = "app:app=web".parse().unwrap();
        assert_eq!(w.namespace, "app");
        assert_eq!(w.labels.get("app"), Some(&"web".to_string()));
        assert_eq!(w.to_string(), "app:app=web");

        assert!(":app=web".parse::<Workload>().is_err());
        assert!("app:broken".parse::<Workload>().is_err());
    }
}
