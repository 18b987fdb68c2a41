//! Provisioning engine adapter.
//!
//! The engine owns resource creation, remote state and diff-based
//! convergence. This module drives it per stage (`init`, `plan`, `apply`,
//! `output`, `destroy`), classifies its failures into [`ProvisionError`]
//! variants, and retries throttled calls with backoff.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{RemoteState, Stage};
use crate::credentials::PipelineCredentials;
use crate::error::{ProvisionError, Result};
use crate::process::{display_command, run_tool, stderr_excerpt, ToolOutput};
use crate::stack::RawOutputs;
use crate::state::RetryConfig;

/// Saved plan file name inside a stage directory.
pub const PLAN_FILE: &str = "tfplan";

static PLAN_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").expect("static regex")
});

static OVERLAP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"InvalidVpc\.Range").expect("static regex"),
        Regex::new(r"InvalidSubnet\.(Conflict|Range)").expect("static regex"),
        Regex::new(r"(?i)cidr .*(conflicts|overlaps) with").expect("static regex"),
        Regex::new(r"(?i)overlapping (cidr|address)").expect("static regex"),
    ]
});

static VERSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)unsupported kubernetes version").expect("static regex"),
        Regex::new(r"(?i)kubernetes version .* is not supported").expect("static regex"),
        Regex::new(r"(?i)InvalidParameterException.*version").expect("static regex"),
    ]
});

static THROTTLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"Throttling(Exception)?").expect("static regex"),
        Regex::new(r"(?i)rate exceeded").expect("static regex"),
        Regex::new(r"RequestLimitExceeded").expect("static regex"),
        Regex::new(r"TooManyRequestsException").expect("static regex"),
        Regex::new(r"SlowDown").expect("static regex"),
    ]
});

/// Resource change counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Resources to create.
    pub add: u32,
    /// Resources to update in place.
    pub change: u32,
    /// Resources to delete.
    pub destroy: u32,
}

impl PlanSummary {
    /// Parse the summary line of `terraform plan` output.
    #[must_use]
    pub fn parse(stdout: &str) -> Option<Self> {
        let caps = PLAN_SUMMARY.captures(stdout)?;
        Some(Self {
            add: caps[1].parse().ok()?,
            change: caps[2].parse().ok()?,
            destroy: caps[3].parse().ok()?,
        })
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.add, self.change, self.destroy
        )
    }
}

/// Result of planning a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOutcome {
    /// Whether the plan has any changes.
    pub changes: bool,
    /// Change counts, when the engine reported them.
    pub summary: PlanSummary,
}

impl PlanOutcome {
    /// A plan with nothing to do.
    #[must_use]
    pub fn no_changes() -> Self {
        Self {
            changes: false,
            summary: PlanSummary::default(),
        }
    }
}

/// What converging a stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Live resources already matched the stack.
    Unchanged,
    /// The plan was applied.
    Applied(PlanSummary),
}

/// A declarative provisioning engine operating on rendered stage directories.
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Prepare `dir` against the stage's remote state.
    async fn init(&self, stage: Stage, dir: &Path, backend: &RemoteState) -> Result<()>;

    /// Compute and save a plan.
    async fn plan(&self, stage: Stage, dir: &Path) -> Result<PlanOutcome>;

    /// Apply the saved plan.
    async fn apply(&self, stage: Stage, dir: &Path) -> Result<()>;

    /// Read the stage outputs from remote state.
    async fn output(&self, stage: Stage, dir: &Path) -> Result<RawOutputs>;

    /// Delete every resource recorded in the stage's state.
    async fn destroy(&self, stage: Stage, dir: &Path) -> Result<()>;
}

/// Plan an initialized stage and apply only if the plan has changes.
///
/// # Errors
///
/// Returns the first engine error.
pub async fn converge(
    engine: &dyn ProvisioningEngine,
    stage: Stage,
    dir: &Path,
) -> Result<Convergence> {
    let plan = engine.plan(stage, dir).await?;
    if !plan.changes {
        info!(%stage, "Stage converged, no changes");
        return Ok(Convergence::Unchanged);
    }
    info!(%stage, summary = %plan.summary, "Applying plan");
    engine.apply(stage, dir).await?;
    Ok(Convergence::Applied(plan.summary))
}

/// Values used to make classified errors specific.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// Requested address block.
    pub cidr: String,
    /// Requested Kubernetes version.
    pub k8s_version: String,
    /// Target region.
    pub region: String,
}

/// Map an engine failure to a typed error.
#[must_use]
pub fn classify_failure(
    stage: Stage,
    command: &str,
    stderr: &str,
    context: &FailureContext,
) -> ProvisionError {
    let detail = stderr_excerpt(stderr);
    let matches = |patterns: &[Regex]| patterns.iter().any(|re| re.is_match(stderr));

    if matches(&OVERLAP_PATTERNS) {
        ProvisionError::AddressOverlap {
            cidr: context.cidr.clone(),
            detail,
        }
    } else if matches(&VERSION_PATTERNS) {
        ProvisionError::VersionSkew {
            version: context.k8s_version.clone(),
            region: context.region.clone(),
            detail,
        }
    } else if matches(&THROTTLE_PATTERNS) {
        ProvisionError::Throttled {
            stage: stage.to_string(),
            detail,
        }
    } else {
        ProvisionError::Engine {
            stage: stage.to_string(),
            command: command.to_string(),
            stderr: detail,
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
///
/// # Errors
///
/// Returns the last error.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && config.should_retry(attempt) => {
                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Terraform command-line adapter.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
    env: Vec<(&'static str, String)>,
    retry: RetryConfig,
    context: FailureContext,
}

impl TerraformCli {
    /// Adapter using `terraform` from `PATH`.
    #[must_use]
    pub fn new(context: FailureContext) -> Self {
        Self {
            binary: "terraform".into(),
            env: vec![
                ("TF_IN_AUTOMATION", "1".into()),
                ("TF_INPUT", "0".into()),
            ],
            retry: RetryConfig::default(),
            context,
        }
    }

    /// Inject credentials into every invocation.
    #[must_use]
    pub fn with_credentials(mut self, credentials: &PipelineCredentials) -> Self {
        self.env.extend(credentials.env_pairs());
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(
        &self,
        stage: Stage,
        dir: &Path,
        args: Vec<String>,
        ok_codes: &[i32],
    ) -> Result<ToolOutput> {
        let command = display_command(&self.binary, &args);
        with_retry(&self.retry, &command, || async {
            let out = run_tool(&self.binary, &args, Some(dir), &self.env).await?;
            if out.code.is_some_and(|c| ok_codes.contains(&c)) {
                Ok(out)
            } else {
                Err(classify_failure(stage, &command, &out.stderr, &self.context))
            }
        })
        .await
    }
}

#[async_trait]
impl ProvisioningEngine for TerraformCli {
    async fn init(&self, stage: Stage, dir: &Path, backend: &RemoteState) -> Result<()> {
        let mut args: Vec<String> = ["init", "-input=false", "-no-color", "-reconfigure"]
            .iter()
            .map(ToString::to_string)
            .collect();
        args.extend(
            backend
                .backend_config()
                .into_iter()
                .map(|(k, v)| format!("-backend-config={k}={v}")),
        );
        self.run(stage, dir, args, &[0]).await?;
        info!(%stage, key = %backend.key, "Initialized stage state");
        Ok(())
    }

    async fn plan(&self, stage: Stage, dir: &Path) -> Result<PlanOutcome> {
        let args = vec![
            "plan".into(),
            "-input=false".into(),
            "-no-color".into(),
            "-detailed-exitcode".into(),
            format!("-out={PLAN_FILE}"),
        ];
        let out = self.run(stage, dir, args, &[0, 2]).await?;
        let changes = out.code == Some(2);
        let summary = PlanSummary::parse(&out.stdout).unwrap_or_default();
        Ok(PlanOutcome { changes, summary })
    }

    async fn apply(&self, stage: Stage, dir: &Path) -> Result<()> {
        let args = vec![
            "apply".into(),
            "-input=false".into(),
            "-no-color".into(),
            PLAN_FILE.into(),
        ];
        self.run(stage, dir, args, &[0]).await?;
        Ok(())
    }

    async fn output(&self, stage: Stage, dir: &Path) -> Result<RawOutputs> {
        let args = vec!["output".into(), "-json".into(), "-no-color".into()];
        let out = self.run(stage, dir, args, &[0]).await?;
        if out.stdout.trim().is_empty() {
            return Ok(RawOutputs::new());
        }
        Ok(serde_json::from_str(&out.stdout)?)
    }

    async fn destroy(&self, stage: Stage, dir: &Path) -> Result<()> {
        let args = vec![
            "destroy".into(),
            "-input=false".into(),
            "-no-color".into(),
            "-auto-approve".into(),
        ];
        self.run(stage, dir, args, &[0]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ctx() -> FailureContext {
        FailureContext {
            cidr: "10.0.0.0/16".into(),
            k8s_version: "1.19".into(),
            region: "eu-west-2".into(),
        }
    }

    #[test]
    fn test_plan_summary_parse() {
        let stdout = "...\nPlan: 57 to add, 0 to change, 2 to destroy.\n";
        let summary = PlanSummary::parse(stdout).unwrap();
        assert_eq!(summary.add, 57);
        assert_eq!(summary.destroy, 2);
        assert_eq!(summary.to_string(), "57 to add, 0 to change, 2 to destroy");
        assert!(PlanSummary::parse("No changes. Your infrastructure matches").is_none());
    }

    #[test]
    fn test_classify_overlap() {
        let stderr = "Error: creating EC2 Subnet: InvalidSubnet.Conflict: The CIDR '10.0.1.0/24' conflicts with another subnet";
        let err = classify_failure(Stage::Network, "terraform apply", stderr, &ctx());
        match err {
            ProvisionError::AddressOverlap { cidr, .. } => assert_eq!(cidr, "10.0.0.0/16"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_classify_version_skew() {
        let stderr = "Error: creating EKS Cluster: InvalidParameterException: unsupported Kubernetes version 1.19";
        let err = classify_failure(Stage::Cluster, "terraform apply", stderr, &ctx());
        assert!(matches!(err, ProvisionError::VersionSkew { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_throttling() {
        let stderr = "Error: ThrottlingException: Rate exceeded";
        let err = classify_failure(Stage::Cluster, "terraform apply", stderr, &ctx());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_other() {
        let err = classify_failure(Stage::Network, "terraform init", "Error: bucket not found", &ctx());
        match err {
            ProvisionError::Engine { stage, command, .. } => {
                assert_eq!(stage, "network");
                assert_eq!(command, "terraform init");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_with_retry_retries_throttling_only() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry(&fast_retry(), "op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(ProvisionError::Throttled {
                    stage: "cluster".into(),
                    detail: "Rate exceeded".into(),
                })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_retry(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProvisionError::InvalidConfig("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_retry(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProvisionError::Throttled {
                stage: "network".into(),
                detail: "SlowDown".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(ProvisionError::Throttled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
