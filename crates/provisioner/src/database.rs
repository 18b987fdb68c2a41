//! Replicated database release and its readiness gate.
//!
//! The release is installed with a packaged chart. Whether it is usable is
//! decided here, from the pods and claims the cluster reports, rather than
//! from the installer's own "deployed" status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Label every pod and claim of a release carries.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Chart release parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseRelease {
    /// Release name.
    pub release_name: String,
    /// Target namespace.
    pub namespace: String,
    /// Chart reference (`repo/chart`).
    pub chart: String,
    /// Chart repository URL.
    pub chart_repo: String,
    /// Pinned chart version.
    pub chart_version: String,
    /// Total replicas (one primary, the rest secondaries).
    pub replicas: u32,
    /// Volume size per replica.
    pub volume_size: String,
    /// Storage class per replica.
    pub storage_class: String,
    /// Seconds to wait for every replica to become ready.
    pub ready_timeout_secs: u64,
}

impl Default for DatabaseRelease {
    fn default() -> Self {
        Self {
            release_name: "mysql".into(),
            namespace: "database".into(),
            chart: "bitnami/mysql".into(),
            chart_repo: "https://charts.bitnami.com/bitnami".into(),
            chart_version: "9.14.1".into(),
            replicas: 3,
            volume_size: "8Gi".into(),
            storage_class: "gp2".into(),
            ready_timeout_secs: 600,
        }
    }
}

impl DatabaseRelease {
    /// Validate replica count and volume spec.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the problem.
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(ProvisionError::InvalidConfig(
                "database.replicas must be at least 1".into(),
            ));
        }
        if self.release_name.is_empty() || self.namespace.is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "database.release_name and database.namespace must be set".into(),
            ));
        }
        if !self.chart.contains('/') {
            return Err(ProvisionError::InvalidConfig(format!(
                "database.chart '{}' must be <repo>/<chart>",
                self.chart
            )));
        }
        let digits = self.volume_size.trim_end_matches(|c: char| c.is_ascii_alphabetic());
        let unit = &self.volume_size[digits.len()..];
        let quantity_ok = !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && digits != "0"
            && ["Mi", "Gi", "Ti"].contains(&unit);
        if !quantity_ok {
            return Err(ProvisionError::InvalidConfig(format!(
                "database.volume_size '{}' must be a quantity like 8Gi",
                self.volume_size
            )));
        }
        Ok(())
    }

    /// Name of the chart repository (`bitnami` in `bitnami/mysql`).
    #[must_use]
    pub fn repo_name(&self) -> &str {
        self.chart.split('/').next().unwrap_or(&self.chart)
    }

    /// Label selector matching the release's pods and claims.
    #[must_use]
    pub fn selector(&self) -> String {
        format!("{INSTANCE_LABEL}={}", self.release_name)
    }

    /// Chart values for a replicated topology with one volume per replica.
    #[must_use]
    pub fn values(&self) -> serde_yaml::Value {
        let persistence = |size: &str, class: &str| {
            let mut m = serde_yaml::Mapping::new();
            m.insert("enabled".into(), true.into());
            m.insert("size".into(), size.into());
            m.insert("storageClass".into(), class.into());
            serde_yaml::Value::Mapping(m)
        };

        let mut primary = serde_yaml::Mapping::new();
        primary.insert(
            "persistence".into(),
            persistence(&self.volume_size, &self.storage_class),
        );

        let mut secondary = serde_yaml::Mapping::new();
        secondary.insert(
            "replicaCount".into(),
            serde_yaml::Value::Number(self.replicas.saturating_sub(1).into()),
        );
        secondary.insert(
            "persistence".into(),
            persistence(&self.volume_size, &self.storage_class),
        );

        let mut values = serde_yaml::Mapping::new();
        let architecture = if self.replicas > 1 {
            "replication"
        } else {
            "standalone"
        };
        values.insert("architecture".into(), architecture.into());
        values.insert("primary".into(), serde_yaml::Value::Mapping(primary));
        values.insert("secondary".into(), serde_yaml::Value::Mapping(secondary));
        serde_yaml::Value::Mapping(values)
    }
}

/// Readiness of one replica pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Pod name.
    pub pod: String,
    /// Pod phase as reported.
    pub phase: String,
    /// Whether the `Ready` condition is `True`.
    pub ready: bool,
    /// Claims mounted by the pod.
    pub claims: Vec<String>,
    /// Whether every mounted claim is bound.
    pub volumes_bound: bool,
}

/// True replica readiness of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    /// Expected replica count.
    pub expected: usize,
    /// Pods with `Ready=True`.
    pub ready: usize,
    /// Ready pods whose claims are all bound.
    pub bound: usize,
    /// Per-pod detail.
    pub replicas: Vec<ReplicaStatus>,
}

impl ReadinessReport {
    /// Every expected replica is ready with a bound volume, and no more.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready == self.expected && self.bound == self.expected
    }

    /// Error carrying the observed counts.
    #[must_use]
    pub fn to_error(&self) -> ProvisionError {
        ProvisionError::DatabaseNotReady {
            ready: self.ready,
            bound: self.bound,
            expected: self.expected,
        }
    }
}

impl std::fmt::Display for ReadinessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} replicas ready, {}/{} volumes bound",
            self.ready, self.expected, self.bound, self.expected
        )
    }
}

/// Evaluate release readiness from observed pods and claims.
#[must_use]
pub fn evaluate_readiness(
    pods: &[Pod],
    claims: &[PersistentVolumeClaim],
    expected: usize,
) -> ReadinessReport {
    let bound: BTreeMap<&str, bool> = claims
        .iter()
        .filter_map(|pvc| {
            let name = pvc.metadata.name.as_deref()?;
            let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
            Some((name, phase == Some("Bound")))
        })
        .collect();

    let replicas: Vec<ReplicaStatus> = pods
        .iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .map(|pod| {
            let status = pod.status.as_ref();
            let ready = status
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                });
            let claim_names: Vec<String> = pod
                .spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .map(|volumes| {
                    volumes
                        .iter()
                        .filter_map(|v| v.persistent_volume_claim.as_ref())
                        .map(|c| c.claim_name.clone())
                        .collect()
                })
                .unwrap_or_default();
            let volumes_bound = !claim_names.is_empty()
                && claim_names
                    .iter()
                    .all(|c| bound.get(c.as_str()).copied().unwrap_or(false));
            ReplicaStatus {
                pod: pod.metadata.name.clone().unwrap_or_default(),
                phase: status
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".into()),
                ready,
                claims: claim_names,
                volumes_bound,
            }
        })
        .collect();

    ReadinessReport {
        expected,
        ready: replicas.iter().filter(|r| r.ready).count(),
        bound: replicas.iter().filter(|r| r.ready && r.volumes_bound).count(),
        replicas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource, PodCondition, PodSpec,
        PodStatus, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, ready: bool, claim: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                volumes: claim.map(|c| {
                    vec![Volume {
                        name: "data".into(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: c.into(),
                            read_only: None,
                        }),
                        ..Volume::default()
                    }]
                }),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
        }
    }

    fn claim(name: &str, phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: None,
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..PersistentVolumeClaimStatus::default()
            }),
        }
    }

    #[test]
    fn test_three_ready_replicas_with_bound_volumes() {
        let pods = vec![
            pod("mysql-primary-0", true, Some("data-mysql-primary-0")),
            pod("mysql-secondary-0", true, Some("data-mysql-secondary-0")),
            pod("mysql-secondary-1", true, Some("data-mysql-secondary-1")),
        ];
        let claims = vec![
            claim("data-mysql-primary-0", "Bound"),
            claim("data-mysql-secondary-0", "Bound"),
            claim("data-mysql-secondary-1", "Bound"),
        ];
        let report = evaluate_readiness(&pods, &claims, 3);
        assert!(report.is_ready());
        assert_eq!(report.to_string(), "3/3 replicas ready, 3/3 volumes bound");
    }

    #[test]
    fn test_partial_startup_is_not_ready() {
        let pods = vec![
            pod("mysql-primary-0", true, Some("data-mysql-primary-0")),
            pod("mysql-secondary-0", true, Some("data-mysql-secondary-0")),
            pod("mysql-secondary-1", false, Some("data-mysql-secondary-1")),
        ];
        let claims = vec![
            claim("data-mysql-primary-0", "Bound"),
            claim("data-mysql-secondary-0", "Bound"),
            claim("data-mysql-secondary-1", "Pending"),
        ];
        let report = evaluate_readiness(&pods, &claims, 3);
        assert!(!report.is_ready());
        assert_eq!(report.ready, 2);
        assert_eq!(report.bound, 2);
        assert!(matches!(
            report.to_error(),
            ProvisionError::DatabaseNotReady {
                ready: 2,
                bound: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn test_ready_pod_without_bound_volume_does_not_count() {
        let pods = vec![pod("mysql-primary-0", true, None)];
        let report = evaluate_readiness(&pods, &[], 1);
        assert_eq!(report.ready, 1);
        assert_eq!(report.bound, 0);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_extra_replicas_are_not_ready() {
        let pods = vec![
            pod("a", true, Some("a")),
            pod("b", true, Some("b")),
        ];
        let claims = vec![claim("a", "Bound"), claim("b", "Bound")];
        assert!(!evaluate_readiness(&pods, &claims, 1).is_ready());
    }

    #[test]
    fn test_values_render_replication() {
        let release = DatabaseRelease::default();
        let yaml = serde_yaml::to_string(&release.values()).unwrap();
        assert!(yaml.contains("architecture: replication"));
        assert!(yaml.contains("replicaCount: 2"));
        assert!(yaml.contains("size: 8Gi"));
        assert!(yaml.contains("storageClass: gp2"));
    }

    #[test]
    fn test_validate_volume_size() {
        DatabaseRelease::default().validate().unwrap();
        let bad = DatabaseRelease {
            volume_size: "8GB".into(),
            ..DatabaseRelease::default()
        };
        assert!(bad.validate().is_err());
        let zero = DatabaseRelease {
            replicas: 0,
            ..DatabaseRelease::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_repo_name_and_selector() {
        let release = DatabaseRelease::default();
        assert_eq!(release.repo_name(), "bitnami");
        assert_eq!(release.selector(), "app.kubernetes.io/instance=mysql");
    }
}
