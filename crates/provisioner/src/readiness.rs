//! Live cluster observation for the readiness gates.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::database::{evaluate_readiness, DatabaseRelease, ReadinessReport};
use crate::error::Result;
use crate::kubeconfig::client_from_path;

/// Label set on nodes backed by the serverless profile.
pub const COMPUTE_TYPE_LABEL: &str = "eks.amazonaws.com/compute-type";

/// Read-mostly view of a running cluster.
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    /// Managed worker nodes whose `Ready` condition is `True`.
    async fn ready_workers(&self, kubeconfig: &Path) -> Result<usize>;

    /// Whether the named storage class exists.
    async fn storage_class_exists(&self, kubeconfig: &Path, name: &str) -> Result<bool>;

    /// True readiness of the database release.
    async fn database_readiness(
        &self,
        kubeconfig: &Path,
        release: &DatabaseRelease,
    ) -> Result<ReadinessReport>;

    /// Delete the release's volume claims. Returns how many were deleted.
    async fn delete_claims(&self, kubeconfig: &Path, release: &DatabaseRelease) -> Result<usize>;
}

/// Count managed workers that report `Ready`. Serverless nodes are excluded.
#[must_use]
pub fn count_ready_workers(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .filter(|node| {
            node.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(COMPUTE_TYPE_LABEL))
                .map_or(true, |t| t != "fargate")
        })
        .filter(|node| {
            node.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        })
        .count()
}

/// Observer backed by the Kubernetes API.
#[derive(Debug, Clone, Default)]
pub struct KubeObserver;

#[async_trait]
impl ClusterObserver for KubeObserver {
    async fn ready_workers(&self, kubeconfig: &Path) -> Result<usize> {
        let client = client_from_path(kubeconfig).await?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes.list(&ListParams::default()).await?;
        Ok(count_ready_workers(&list.items))
    }

    async fn storage_class_exists(&self, kubeconfig: &Path, name: &str) -> Result<bool> {
        let client = client_from_path(kubeconfig).await?;
        let classes: Api<StorageClass> = Api::all(client);
        Ok(classes.get_opt(name).await?.is_some())
    }

    async fn database_readiness(
        &self,
        kubeconfig: &Path,
        release: &DatabaseRelease,
    ) -> Result<ReadinessReport> {
        let client = client_from_path(kubeconfig).await?;
        let params = ListParams::default().labels(&release.selector());
        let pods: Api<Pod> = Api::namespaced(client.clone(), &release.namespace);
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(client, &release.namespace);
        let pods = pods.list(&params).await?;
        let claims = claims.list(&params).await?;
        let expected = usize::try_from(release.replicas).unwrap_or(usize::MAX);
        Ok(evaluate_readiness(&pods.items, &claims.items, expected))
    }

    async fn delete_claims(&self, kubeconfig: &Path, release: &DatabaseRelease) -> Result<usize> {
        let client = client_from_path(kubeconfig).await?;
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(client, &release.namespace);
        let params = ListParams::default().labels(&release.selector());
        let mut deleted = 0;
        for claim in claims.list(&params).await?.items {
            if let Some(name) = claim.metadata.name {
                claims.delete(&name, &DeleteParams::default()).await?;
                debug!(claim = %name, "Deleted volume claim");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Probe until `done` holds or `timeout` passes.
///
/// Probe errors are logged and retried, since the API is often briefly
/// unreachable while a stage settles. Returns the last observation, done or
/// not, so the caller can report true counts.
///
/// # Errors
///
/// Returns the last probe error if no probe ever succeeded.
pub async fn poll_until<T, F, Fut, D>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
    done: D,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    D: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut last: Option<T> = None;
    loop {
        match probe().await {
            Ok(observed) => {
                if done(&observed) {
                    return Ok(observed);
                }
                last = Some(observed);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return last.map_or(Err(e), Ok);
                }
                warn!(what, error = %e, "Probe failed, retrying");
            }
        }
        if Instant::now() >= deadline {
            if let Some(observed) = last {
                return Ok(observed);
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(name: &str, ready: bool, fargate: bool) -> Node {
        let labels = fargate.then(|| {
            BTreeMap::from([(COMPUTE_TYPE_LABEL.to_string(), "fargate".to_string())])
        });
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels,
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn test_count_ready_workers_excludes_serverless() {
        let nodes = vec![
            node("w1", true, false),
            node("w2", true, false),
            node("w3", false, false),
            node("fargate-1", true, true),
        ];
        assert_eq!(count_ready_workers(&nodes), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_when_done() {
        let calls = AtomicUsize::new(0);
        let result = poll_until(
            "workers",
            Duration::from_secs(60),
            Duration::from_secs(5),
            || async { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |n| *n >= 3,
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out_with_last_observation() {
        let result = poll_until(
            "workers",
            Duration::from_secs(30),
            Duration::from_secs(10),
            || async { Ok(2_usize) },
            |n| *n >= 3,
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_surfaces_error_without_observation() {
        let result: Result<usize> = poll_until(
            "workers",
            Duration::from_secs(30),
            Duration::from_secs(10),
            || async { Err(ProvisionError::InvalidConfig("unreachable".into())) },
            |n| *n >= 3,
        )
        .await;
        assert!(result.is_err());
    }
}
