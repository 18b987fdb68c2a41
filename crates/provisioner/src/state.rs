//! Pipeline run state persistence.
//!
//! A run walks a fixed sequence of steps. Its record is saved after every
//! transition so that `status` can report where a run stopped and what it
//! had already created.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{EnvironmentParams, Stage};
use crate::database::ReadinessReport;
use crate::error::Result;
use crate::stack::{ClusterOutputs, NetworkOutputs};

/// Coarse pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Accepted, nothing started.
    Queued,
    /// Running the network, cluster and database stages.
    Provisioning,
    /// Merging cluster access and publishing outputs.
    ConfiguringAccess,
    /// Finished successfully.
    Done,
    /// Halted on an error.
    Failed,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::ConfiguringAccess => "configuring access",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Not yet started.
    Queued,
    /// Checking the address block against existing networks.
    CheckingAddressSpace,
    /// Converging the network stack.
    ProvisioningNetwork,
    /// Converging the cluster stack.
    ProvisioningCluster,
    /// Waiting for worker nodes to register.
    WaitingClusterReady,
    /// Installing or upgrading the database release.
    DeployingDatabase,
    /// Waiting for every replica to be ready with a bound volume.
    WaitingDatabaseReady,
    /// Merging cluster access and emitting outputs.
    ConfiguringAccess,
    /// Run complete.
    Done,
    /// Run halted.
    Failed,
}

impl PipelineStep {
    /// The step that follows this one on success.
    #[must_use]
    pub fn next(&self) -> Self {
        match self {
            Self::Queued => Self::CheckingAddressSpace,
            Self::CheckingAddressSpace => Self::ProvisioningNetwork,
            Self::ProvisioningNetwork => Self::ProvisioningCluster,
            Self::ProvisioningCluster => Self::WaitingClusterReady,
            Self::WaitingClusterReady => Self::DeployingDatabase,
            Self::DeployingDatabase => Self::WaitingDatabaseReady,
            Self::WaitingDatabaseReady => Self::ConfiguringAccess,
            Self::ConfiguringAccess | Self::Done => Self::Done,
            Self::Failed => Self::Failed,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::CheckingAddressSpace => "Checking address space",
            Self::ProvisioningNetwork => "Provisioning network",
            Self::ProvisioningCluster => "Provisioning cluster",
            Self::WaitingClusterReady => "Waiting for worker nodes",
            Self::DeployingDatabase => "Deploying database",
            Self::WaitingDatabaseReady => "Waiting for database replicas",
            Self::ConfiguringAccess => "Configuring cluster access",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Step number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::Queued | Self::Failed => 0,
            Self::CheckingAddressSpace => 1,
            Self::ProvisioningNetwork => 2,
            Self::ProvisioningCluster => 3,
            Self::WaitingClusterReady => 4,
            Self::DeployingDatabase => 5,
            Self::WaitingDatabaseReady => 6,
            Self::ConfiguringAccess => 7,
            Self::Done => 8,
        }
    }

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 8;

    /// Phase this step belongs to.
    #[must_use]
    pub fn phase(&self) -> PipelinePhase {
        match self {
            Self::Queued => PipelinePhase::Queued,
            Self::CheckingAddressSpace
            | Self::ProvisioningNetwork
            | Self::ProvisioningCluster
            | Self::WaitingClusterReady
            | Self::DeployingDatabase
            | Self::WaitingDatabaseReady => PipelinePhase::Provisioning,
            Self::ConfiguringAccess => PipelinePhase::ConfiguringAccess,
            Self::Done => PipelinePhase::Done,
            Self::Failed => PipelinePhase::Failed,
        }
    }

    /// Stage whose remote resources this step creates, if any.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ProvisioningNetwork => Some(Stage::Network),
            Self::ProvisioningCluster | Self::WaitingClusterReady => Some(Stage::Cluster),
            Self::DeployingDatabase | Self::WaitingDatabaseReady => Some(Stage::Database),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id.
    pub run_id: String,
    /// Environment parameters the run was started with.
    pub environment: EnvironmentParams,
    /// Current step.
    pub step: PipelineStep,
    /// Step that failed, if the run halted.
    #[serde(default)]
    pub failed_step: Option<PipelineStep>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Last state update.
    pub updated_at: DateTime<Utc>,
    /// Network stage outputs, once applied.
    #[serde(default)]
    pub network: Option<NetworkOutputs>,
    /// Cluster stage outputs, once applied.
    #[serde(default)]
    pub cluster: Option<ClusterOutputs>,
    /// Last observed database readiness.
    #[serde(default)]
    pub database: Option<ReadinessReport>,
    /// Last error message.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Stages this run started, in order.
    #[serde(default)]
    pub started_stages: Vec<Stage>,
    /// Stages that did not exist before this run touched them. Only these
    /// are torn down by a rollback.
    #[serde(default)]
    pub created_stages: Vec<Stage>,
    /// Stages this run completed, in order.
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    /// Stages torn down after a failure.
    #[serde(default)]
    pub rolled_back: Vec<Stage>,

    #[serde(skip)]
    path: PathBuf,
}

impl PipelineRun {
    /// Create a new run record under `env_dir`.
    #[must_use]
    pub fn new(environment: EnvironmentParams, env_dir: &Path) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            environment,
            step: PipelineStep::Queued,
            failed_step: None,
            started_at: now,
            updated_at: now,
            network: None,
            cluster: None,
            database: None,
            last_error: None,
            started_stages: Vec::new(),
            created_stages: Vec::new(),
            completed_stages: Vec::new(),
            rolled_back: Vec::new(),
            path: Self::state_file(env_dir),
        }
    }

    /// Record file for an environment directory.
    #[must_use]
    pub fn state_file(env_dir: &Path) -> PathBuf {
        env_dir.join("run.json")
    }

    /// Load the last run record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(env_dir: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(env_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let mut run: Self = serde_json::from_str(&content)?;
        run.path = path;
        Ok(Some(run))
    }

    /// Save the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = Utc::now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Move to `step` and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_step(&mut self, step: PipelineStep) -> Result<()> {
        info!(run_id = %self.run_id, "Step: {} -> {}", self.step, step);
        if let Some(stage) = step.stage() {
            if !self.started_stages.contains(&stage) {
                self.started_stages.push(stage);
            }
        }
        self.step = step;
        self.save()
    }

    /// Advance to the next step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn advance(&mut self) -> Result<()> {
        let next = self.step.next();
        self.set_step(next)
    }

    /// Record that this run created `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn mark_created(&mut self, stage: Stage) -> Result<()> {
        if !self.created_stages.contains(&stage) {
            self.created_stages.push(stage);
        }
        self.save()
    }

    /// Mark `stage` as completed.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn complete_stage(&mut self, stage: Stage) -> Result<()> {
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
        self.save()
    }

    /// Halt the run at its current step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.failed_step = Some(self.step);
        self.last_error = Some(error.to_string());
        self.step = PipelineStep::Failed;
        self.save()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> PipelinePhase {
        self.step.phase()
    }

    /// Whether the run finished successfully.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == PipelineStep::Done
    }
}

/// Retry configuration for transient engine errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EnvironmentParams {
        EnvironmentParams {
            env_prefix: "dev".into(),
            k8s_version: "1.28".into(),
            cluster_name: "my-test-cluster".into(),
            region: "eu-west-2".into(),
        }
    }

    #[test]
    fn test_step_progression() {
        let mut step = PipelineStep::Queued;
        let mut phases = vec![step.phase()];
        while step != PipelineStep::Done {
            step = step.next();
            phases.push(step.phase());
        }
        assert_eq!(step.step_number(), PipelineStep::TOTAL_STEPS);
        assert_eq!(PipelineStep::Done.next(), PipelineStep::Done);
        assert_eq!(PipelineStep::Failed.next(), PipelineStep::Failed);
        assert_eq!(
            PipelineStep::Queued.next().description(),
            "Checking address space"
        );

        phases.dedup();
        assert_eq!(
            phases,
            vec![
                PipelinePhase::Queued,
                PipelinePhase::Provisioning,
                PipelinePhase::ConfiguringAccess,
                PipelinePhase::Done,
            ]
        );
    }

    #[test]
    fn test_run_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = PipelineRun::new(params(), dir.path());
        run.set_step(PipelineStep::ProvisioningNetwork).unwrap();
        run.mark_created(Stage::Network).unwrap();
        run.complete_stage(Stage::Network).unwrap();
        run.set_step(PipelineStep::ProvisioningCluster).unwrap();
        run.fail("boom").unwrap();

        let loaded = PipelineRun::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.phase(), PipelinePhase::Failed);
        assert_eq!(loaded.failed_step, Some(PipelineStep::ProvisioningCluster));
        assert_eq!(loaded.started_stages, vec![Stage::Network, Stage::Cluster]);
        assert_eq!(loaded.created_stages, vec![Stage::Network]);
        assert_eq!(loaded.completed_stages, vec![Stage::Network]);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineRun::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(config.delay_for_attempt(100), config.max_delay);

        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
        assert!(!RetryConfig::none().should_retry(1));
    }
}
