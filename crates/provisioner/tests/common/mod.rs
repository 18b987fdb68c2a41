#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(dead_code)]

//! In-memory stand-ins for the external tools a run drives.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use eksprov::cloud::CloudAccess;
use eksprov::config::{EnvironmentParams, RemoteState, Stage};
use eksprov::database::{DatabaseRelease, ReadinessReport, ReplicaStatus};
use eksprov::engine::{PlanOutcome, PlanSummary, ProvisioningEngine};
use eksprov::error::{ProvisionError, Result};
use eksprov::helm::ReleaseDeployer;
use eksprov::network::ExistingVpc;
use eksprov::readiness::ClusterObserver;
use eksprov::stack::{OutputValue, RawOutputs};
use eksprov::{ProjectConfig, Provisioner, ResolvedEnvironment, Toolchain};

pub const ENDPOINT: &str = "https://ABCDEF.gr7.eu-west-2.eks.amazonaws.com";

/// Ordered record of every mutating call across all fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Engine whose remote state is a set of backend keys holding resources.
///
/// Every call after `init` is routed to the state key that `init` bound to
/// the stage directory, so environments sharing a harness stay apart.
pub struct FakeEngine {
    journal: Journal,
    bound: Mutex<HashMap<PathBuf, String>>,
    existing: Mutex<HashSet<String>>,
    partial: Mutex<HashSet<String>>,
    fail_apply: Mutex<Option<Stage>>,
}

impl FakeEngine {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            bound: Mutex::new(HashMap::new()),
            existing: Mutex::new(HashSet::new()),
            partial: Mutex::new(HashSet::new()),
            fail_apply: Mutex::new(None),
        }
    }

    /// Whether `stage` of `env` holds resources.
    pub fn exists(&self, env: &ResolvedEnvironment, stage: Stage) -> bool {
        let key = env.remote_state(stage).unwrap().key;
        self.existing.lock().unwrap().contains(&key)
    }

    /// Leave `stage` of `env` as an interrupted apply would: resources but
    /// only some of the outputs.
    pub fn leave_partial(&self, env: &ResolvedEnvironment, stage: Stage) {
        let key = env.remote_state(stage).unwrap().key;
        self.existing.lock().unwrap().insert(key.clone());
        self.partial.lock().unwrap().insert(key);
    }

    pub fn fail_apply_of(&self, stage: Stage) {
        *self.fail_apply.lock().unwrap() = Some(stage);
    }

    fn key(&self, dir: &Path) -> String {
        self.bound
            .lock()
            .unwrap()
            .get(dir)
            .cloned()
            .unwrap_or_else(|| panic!("{} used before init", dir.display()))
    }

    fn holds(&self, dir: &Path) -> bool {
        self.existing.lock().unwrap().contains(&self.key(dir))
    }
}

/// Names referenced as `${var.NAME}` that the stack does not declare.
fn undeclared_variables(stack: &serde_json::Value) -> Vec<String> {
    let text = stack.to_string();
    let declared = stack.get("variable").and_then(|v| v.as_object());
    let mut missing = Vec::new();
    for (i, _) in text.match_indices("${var.") {
        let name: String = text[i + 6..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !declared.is_some_and(|d| d.contains_key(&name)) && !missing.contains(&name) {
            missing.push(name);
        }
    }
    missing
}

fn output(value: serde_json::Value) -> OutputValue {
    OutputValue {
        value,
        sensitive: false,
    }
}

#[async_trait]
impl ProvisioningEngine for FakeEngine {
    async fn init(&self, stage: Stage, dir: &Path, backend: &RemoteState) -> Result<()> {
        let stack: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("main.tf.json"))?)?;
        let undeclared = undeclared_variables(&stack);
        if !undeclared.is_empty() {
            return Err(ProvisionError::Engine {
                stage: stage.to_string(),
                command: "terraform init".into(),
                stderr: format!("Reference to undeclared input variable: {undeclared:?}"),
            });
        }
        assert!(backend.key.ends_with(&format!("{stage}.tfstate")));
        self.bound
            .lock()
            .unwrap()
            .insert(dir.to_path_buf(), backend.key.clone());
        Ok(())
    }

    async fn plan(&self, _stage: Stage, dir: &Path) -> Result<PlanOutcome> {
        if self.holds(dir) {
            return Ok(PlanOutcome::no_changes());
        }
        Ok(PlanOutcome {
            changes: true,
            summary: PlanSummary {
                add: 12,
                change: 0,
                destroy: 0,
            },
        })
    }

    async fn apply(&self, stage: Stage, dir: &Path) -> Result<()> {
        if *self.fail_apply.lock().unwrap() == Some(stage) {
            return Err(ProvisionError::Engine {
                stage: stage.to_string(),
                command: "terraform apply".into(),
                stderr: "UnsupportedAvailabilityZoneException".into(),
            });
        }
        self.journal.push(format!("apply:{stage}"));
        self.existing.lock().unwrap().insert(self.key(dir));
        Ok(())
    }

    async fn output(&self, stage: Stage, dir: &Path) -> Result<RawOutputs> {
        let mut raw = RawOutputs::new();
        if !self.holds(dir) {
            return Ok(raw);
        }
        let partial = self.partial.lock().unwrap().contains(&self.key(dir));
        match stage {
            Stage::Network => {
                raw.insert("vpc_id".into(), output(json!("vpc-0abc")));
                if partial {
                    return Ok(raw);
                }
                raw.insert(
                    "private_subnets".into(),
                    output(json!(["subnet-p1", "subnet-p2", "subnet-p3"])),
                );
                raw.insert(
                    "public_subnets".into(),
                    output(json!(["subnet-u1", "subnet-u2", "subnet-u3"])),
                );
            }
            Stage::Cluster => {
                raw.insert("cluster_endpoint".into(), output(json!(ENDPOINT)));
                raw.insert("cluster_name".into(), output(json!("my-test-cluster")));
                raw.insert(
                    "fargate_profile_names".into(),
                    output(json!(["serverless"])),
                );
            }
            Stage::Database => {}
        }
        Ok(raw)
    }

    async fn destroy(&self, stage: Stage, dir: &Path) -> Result<()> {
        let key = self.key(dir);
        self.journal.push(format!("destroy:{stage}"));
        self.existing.lock().unwrap().remove(&key);
        self.partial.lock().unwrap().remove(&key);
        Ok(())
    }
}

// =============================================================================
// Chart installer, cloud API, cluster API
// =============================================================================

/// Chart installer tracking installed releases by kubeconfig path, which is
/// unique per environment.
pub struct FakeDeployer {
    journal: Journal,
    installed: Mutex<HashSet<PathBuf>>,
}

#[async_trait]
impl ReleaseDeployer for FakeDeployer {
    async fn add_repo(&self, _release: &DatabaseRelease) -> Result<()> {
        Ok(())
    }

    async fn is_installed(&self, _release: &DatabaseRelease, kubeconfig: &Path) -> Result<bool> {
        Ok(self.installed.lock().unwrap().contains(kubeconfig))
    }

    async fn upgrade_install(
        &self,
        release: &DatabaseRelease,
        values_file: &Path,
        kubeconfig: &Path,
    ) -> Result<()> {
        assert!(values_file.exists());
        self.journal.push(format!("install:{}", release.release_name));
        self.installed
            .lock()
            .unwrap()
            .insert(kubeconfig.to_path_buf());
        Ok(())
    }

    async fn uninstall(&self, release: &DatabaseRelease, kubeconfig: &Path) -> Result<()> {
        self.journal.push(format!("uninstall:{}", release.release_name));
        self.installed.lock().unwrap().remove(kubeconfig);
        Ok(())
    }
}

pub struct FakeCloud {
    journal: Journal,
    pub vpcs: Mutex<Vec<ExistingVpc>>,
}

#[async_trait]
impl CloudAccess for FakeCloud {
    async fn describe_vpcs(&self, _region: &str) -> Result<Vec<ExistingVpc>> {
        Ok(self.vpcs.lock().unwrap().clone())
    }

    async fn update_kubeconfig(
        &self,
        cluster: &str,
        _region: &str,
        path: Option<&Path>,
    ) -> Result<()> {
        match path {
            Some(path) => std::fs::write(path, "apiVersion: v1\nkind: Config\n")?,
            None => self.journal.push(format!("kubeconfig:{cluster}")),
        }
        Ok(())
    }

    async fn list_fargate_profiles(&self, _cluster: &str, _region: &str) -> Result<Vec<String>> {
        Ok(vec!["serverless".into()])
    }
}

pub struct FakeObserver {
    pub ready_workers: AtomicUsize,
    pub database: Mutex<ReadinessReport>,
    pub claims_deleted: AtomicUsize,
}

#[async_trait]
impl ClusterObserver for FakeObserver {
    async fn ready_workers(&self, kubeconfig: &Path) -> Result<usize> {
        assert!(kubeconfig.exists(), "cluster probed before access was configured");
        Ok(self.ready_workers.load(Ordering::SeqCst))
    }

    async fn storage_class_exists(&self, _kubeconfig: &Path, name: &str) -> Result<bool> {
        Ok(name == "gp2")
    }

    async fn database_readiness(
        &self,
        _kubeconfig: &Path,
        _release: &DatabaseRelease,
    ) -> Result<ReadinessReport> {
        Ok(self.database.lock().unwrap().clone())
    }

    async fn delete_claims(&self, _kubeconfig: &Path, release: &DatabaseRelease) -> Result<usize> {
        let n = release.replicas as usize;
        self.claims_deleted.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

/// A report with `ready` of three replicas ready, all of them bound.
pub fn report(ready: usize) -> ReadinessReport {
    let replicas = (0..3)
        .map(|i| ReplicaStatus {
            pod: format!("mysql-{i}"),
            phase: "Running".into(),
            ready: i < ready,
            claims: vec![format!("data-mysql-{i}")],
            volumes_bound: i < ready,
        })
        .collect();
    ReadinessReport {
        expected: 3,
        ready,
        bound: ready,
        replicas,
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Shared fakes plus a scratch work directory.
pub struct Harness {
    pub work_dir: tempfile::TempDir,
    pub journal: Journal,
    pub engine: Arc<FakeEngine>,
    pub cloud: Arc<FakeCloud>,
    pub observer: Arc<FakeObserver>,
    deployer: Arc<FakeDeployer>,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            work_dir: tempfile::tempdir().unwrap(),
            engine: Arc::new(FakeEngine::new(journal.clone())),
            deployer: Arc::new(FakeDeployer {
                journal: journal.clone(),
                installed: Mutex::new(HashSet::new()),
            }),
            cloud: Arc::new(FakeCloud {
                journal: journal.clone(),
                vpcs: Mutex::new(Vec::new()),
            }),
            observer: Arc::new(FakeObserver {
                ready_workers: AtomicUsize::new(3),
                database: Mutex::new(report(3)),
                claims_deleted: AtomicUsize::new(0),
            }),
            journal,
        }
    }

    pub fn tools(&self) -> Toolchain {
        Toolchain {
            engine: self.engine.clone(),
            deployer: self.deployer.clone(),
            cloud: self.cloud.clone(),
            observer: self.observer.clone(),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.path().to_path_buf()
    }

    pub fn provisioner(&self, env: ResolvedEnvironment) -> Provisioner {
        Provisioner::new(env, self.work_dir(), self.tools())
            .with_holder("tester@ci")
            .with_poll_interval(Duration::from_secs(1))
    }
}

pub fn params(env_prefix: &str, cluster_name: &str) -> EnvironmentParams {
    EnvironmentParams {
        env_prefix: env_prefix.into(),
        k8s_version: "1.28".into(),
        cluster_name: cluster_name.into(),
        region: "eu-west-2".into(),
    }
}

/// Project with a state bucket and short readiness timeouts.
pub fn project() -> ProjectConfig {
    let mut project = ProjectConfig::default();
    project.state.bucket = Some("eksprov-tf-state".into());
    project.cluster.ready_timeout_secs = 30;
    project.database.ready_timeout_secs = 20;
    project
}

/// The `dev` environment: 1.28, `my-test-cluster`, eu-west-2.
pub fn dev() -> ResolvedEnvironment {
    project().resolved(params("dev", "my-test-cluster")).unwrap()
}

/// A sibling `staging` environment in the same project.
pub fn staging() -> ResolvedEnvironment {
    project()
        .resolved(params("staging", "staging-cluster"))
        .unwrap()
}
