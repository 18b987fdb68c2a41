//! Provisioning orchestration.
//!
//! This module coordinates the three stages of an environment:
//! - Network: VPC, subnets and egress through the provisioning engine
//! - Cluster: managed control plane, worker group and serverless profile
//! - Database: replicated chart release and its readiness gate
//!
//! Mutating operations run under the environment's state lease. Each run is
//! recorded step by step so `status` can show where it stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cloud::{AwsCli, CloudAccess};
use crate::config::{ResolvedEnvironment, Stage};
use crate::credentials::PipelineCredentials;
use crate::database::ReadinessReport;
use crate::engine::{
    converge, Convergence, FailureContext, PlanOutcome, ProvisioningEngine, TerraformCli,
};
use crate::error::{ProvisionError, Result};
use crate::helm::{write_values, HelmCli, ReleaseDeployer};
use crate::lease::{
    default_holder, FileLeaseStore, LeaseStore, StateLease, DEFAULT_LEASE_DURATION,
};
use crate::network::check_overlap;
use crate::outputs::{emit_output, CLUSTER_ENDPOINT};
use crate::readiness::{poll_until, ClusterObserver, KubeObserver};
use crate::stack::{
    render_cluster, render_cluster_detached, render_network, write_stack, ClusterOutputs,
    NetworkOutputs,
};
use crate::state::{PipelineRun, PipelineStep};
use crate::ui;

/// Default interval between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What to do with created stages when a run fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop and keep everything for inspection or a re-run.
    #[default]
    Halt,
    /// Tear down the stages the run created, newest first.
    Destroy,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "destroy" => Ok(Self::Destroy),
            _ => Err(format!("Unknown failure policy: {s}. Valid options: halt, destroy")),
        }
    }
}

/// Options for a provisioning run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Compensating action on failure.
    pub failure_policy: FailurePolicy,
    /// Merge access into the operator's kubeconfig and publish outputs.
    pub configure_access: bool,
    /// Output variable file; `$GITHUB_OUTPUT` when unset.
    pub output_file: Option<PathBuf>,
}

/// External systems the provisioner drives.
#[derive(Clone)]
pub struct Toolchain {
    /// Provisioning engine.
    pub engine: Arc<dyn ProvisioningEngine>,
    /// Chart installer.
    pub deployer: Arc<dyn ReleaseDeployer>,
    /// Cloud API.
    pub cloud: Arc<dyn CloudAccess>,
    /// Cluster API.
    pub observer: Arc<dyn ClusterObserver>,
}

impl Toolchain {
    /// Command-line tools from `PATH`, with optional injected credentials.
    #[must_use]
    pub fn system(env: &ResolvedEnvironment, credentials: Option<&PipelineCredentials>) -> Self {
        let context = FailureContext {
            cidr: env.network.cidr.to_string(),
            k8s_version: env.params.k8s_version.clone(),
            region: env.params.region.clone(),
        };
        let mut engine = TerraformCli::new(context);
        let mut deployer = HelmCli::default();
        let mut cloud = AwsCli::default();
        if let Some(creds) = credentials {
            engine = engine.with_credentials(creds);
            deployer = deployer.with_credentials(creds);
            cloud = cloud.with_credentials(creds);
        }
        Self {
            engine: Arc::new(engine),
            deployer: Arc::new(deployer),
            cloud: Arc::new(cloud),
            observer: Arc::new(KubeObserver),
        }
    }
}

/// Planned changes of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    /// Stage.
    pub stage: Stage,
    /// Plan, or `None` if it cannot be planned until an earlier stage exists.
    pub outcome: Option<PlanOutcome>,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Run id.
    pub run_id: String,
    /// Network outputs.
    pub network: NetworkOutputs,
    /// Cluster outputs.
    pub cluster: ClusterOutputs,
    /// Final database readiness.
    pub database: ReadinessReport,
    /// What each engine stage did.
    pub convergence: Vec<(Stage, Convergence)>,
    /// File the endpoint was published to.
    pub output_file: Option<PathBuf>,
}

/// Values produced while a run progresses.
#[derive(Default)]
struct RunContext {
    network: Option<NetworkOutputs>,
    cluster: Option<ClusterOutputs>,
    database: Option<ReadinessReport>,
    convergence: Vec<(Stage, Convergence)>,
    output_file: Option<PathBuf>,
}

/// Drives one environment through its stages.
pub struct Provisioner {
    env: ResolvedEnvironment,
    work_dir: PathBuf,
    tools: Toolchain,
    leases: Arc<dyn LeaseStore>,
    holder: String,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl Provisioner {
    /// Create a provisioner with leases kept under `work_dir`.
    #[must_use]
    pub fn new(env: ResolvedEnvironment, work_dir: impl Into<PathBuf>, tools: Toolchain) -> Self {
        let work_dir = work_dir.into();
        Self {
            leases: Arc::new(FileLeaseStore::new(work_dir.join("leases"))),
            env,
            work_dir,
            tools,
            holder: default_holder(),
            lease_duration: DEFAULT_LEASE_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use a different lease store.
    #[must_use]
    pub fn with_lease_store(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = leases;
        self
    }

    /// Override the lease holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Override the readiness probe interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The environment being provisioned.
    #[must_use]
    pub fn environment(&self) -> &ResolvedEnvironment {
        &self.env
    }

    /// Directory holding this environment's files.
    #[must_use]
    pub fn env_dir(&self) -> PathBuf {
        self.env.env_dir(&self.work_dir)
    }

    /// Last persisted run record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn last_run(&self) -> Result<Option<PipelineRun>> {
        PipelineRun::load(&self.env_dir())
    }

    /// Write every stage's files without running anything.
    ///
    /// The cluster stack is rendered against input variables in place of
    /// network ids.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn render(&self) -> Result<Vec<PathBuf>> {
        let network = write_stack(
            &self.env.stage_dir(&self.work_dir, Stage::Network),
            &render_network(&self.env),
        )?;
        let cluster = write_stack(
            &self.env.stage_dir(&self.work_dir, Stage::Cluster),
            &render_cluster_detached(&self.env),
        )?;
        let values = write_values(
            &self.env.stage_dir(&self.work_dir, Stage::Database),
            &self.env.database,
        )?;
        Ok(vec![network, cluster, values])
    }

    /// Render and initialize the engine stages.
    ///
    /// # Errors
    ///
    /// Returns the first engine error.
    pub async fn init(&self) -> Result<()> {
        let network = self.existing_network().await?;
        self.prepare_stage(Stage::Cluster, network.as_ref()).await?;
        Ok(())
    }

    /// Plan the engine stages without applying anything.
    ///
    /// The cluster stage is only planned once the network exists.
    ///
    /// # Errors
    ///
    /// Returns the first engine error.
    pub async fn plan(&self) -> Result<Vec<StagePlan>> {
        let network_dir = self.prepare_stage(Stage::Network, None).await?;
        let network_plan = self.tools.engine.plan(Stage::Network, &network_dir).await?;
        let mut plans = vec![StagePlan {
            stage: Stage::Network,
            outcome: Some(network_plan),
        }];

        let cluster_plan = match self.network_outputs(&network_dir).await? {
            Some(network) => {
                let dir = self.prepare_stage(Stage::Cluster, Some(&network)).await?;
                Some(self.tools.engine.plan(Stage::Cluster, &dir).await?)
            }
            None => {
                info!("Network not yet created, deferring cluster plan");
                None
            }
        };
        plans.push(StagePlan {
            stage: Stage::Cluster,
            outcome: cluster_plan,
        });
        Ok(plans)
    }

    /// Run the stages to completion under the environment lease.
    ///
    /// # Errors
    ///
    /// Returns `Lease` if another run holds the environment, or the error
    /// that halted the run.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let mut run = PipelineRun::new(self.env.params.clone(), &self.env_dir());
        let mut lease = self.acquire_lease(&run.run_id)?;
        run.save()?;
        info!(
            run_id = %run.run_id,
            environment = %self.env.params.env_prefix,
            "Starting provisioning run"
        );

        let mut ctx = RunContext::default();
        let result = self.drive(&mut run, &mut lease, &mut ctx, options).await;

        if let Err(ref e) = result {
            error!(step = ?run.step, error = %e, class = %e.class(), "Run failed");
            ui::print_error(&format!("Run failed at step '{}': {e}", run.step));
            if let Err(save_err) = run.fail(&e.to_string()) {
                warn!(error = %save_err, "Failed to save failed run record");
            }

            match options.failure_policy {
                FailurePolicy::Halt => {
                    ui::print_info(
                        "State has been kept. Fix the cause and re-run, or run `eksprov destroy`.",
                    );
                }
                FailurePolicy::Destroy => {
                    self.rollback(&mut run).await;
                }
            }
        }

        if let Err(e) = lease.release() {
            if result.is_ok() {
                return Err(e.into());
            }
            warn!(error = %e, "Failed to release state lease");
        }
        result?;

        let summary = RunSummary {
            run_id: run.run_id.clone(),
            network: ctx.network.ok_or_else(|| missing(Stage::Network, "vpc_id"))?,
            cluster: ctx
                .cluster
                .ok_or_else(|| missing(Stage::Cluster, "cluster_endpoint"))?,
            database: ctx.database.ok_or_else(|| missing(Stage::Database, "readiness"))?,
            convergence: ctx.convergence,
            output_file: ctx.output_file,
        };
        Ok(summary)
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        lease: &mut StateLease,
        ctx: &mut RunContext,
        options: &RunOptions,
    ) -> Result<()> {
        loop {
            run.advance()?;
            if run.is_complete() {
                return Ok(());
            }
            ui::print_progress_step(
                run.step.step_number(),
                PipelineStep::TOTAL_STEPS,
                run.step.description(),
            );
            self.execute_step(run, ctx, options).await?;
            lease.renew()?;
        }
    }

    async fn execute_step(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        options: &RunOptions,
    ) -> Result<()> {
        info!(step = ?run.step, "Executing step");
        match run.step {
            PipelineStep::Queued | PipelineStep::Done | PipelineStep::Failed => {}
            PipelineStep::CheckingAddressSpace => self.check_address_space().await?,
            PipelineStep::ProvisioningNetwork => {
                let network = self.provision_network(run, ctx).await?;
                run.network = Some(network.clone());
                ctx.network = Some(network);
                run.complete_stage(Stage::Network)?;
            }
            PipelineStep::ProvisioningCluster => {
                let network = ctx
                    .network
                    .clone()
                    .ok_or_else(|| missing(Stage::Network, "vpc_id"))?;
                let cluster = self.provision_cluster(run, &network, ctx).await?;
                run.cluster = Some(cluster.clone());
                ctx.cluster = Some(cluster);
                run.save()?;
            }
            PipelineStep::WaitingClusterReady => {
                self.wait_cluster_ready().await?;
                run.complete_stage(Stage::Cluster)?;
            }
            PipelineStep::DeployingDatabase => self.deploy_database(run).await?,
            PipelineStep::WaitingDatabaseReady => {
                let report = self.wait_database_ready().await;
                let (report, outcome) = match report {
                    Ok(report) => (Some(report), Ok(())),
                    Err((report, e)) => (report, Err(e)),
                };
                run.database.clone_from(&report);
                ctx.database = report;
                outcome?;
                run.complete_stage(Stage::Database)?;
            }
            PipelineStep::ConfiguringAccess => {
                if options.configure_access {
                    let cluster = ctx
                        .cluster
                        .clone()
                        .ok_or_else(|| missing(Stage::Cluster, "cluster_endpoint"))?;
                    ctx.output_file = self.configure_access(&cluster, options).await?;
                } else {
                    ui::print_progress("skipped (not a pipeline run)");
                }
            }
        }
        Ok(())
    }

    /// Fail early if the desired address block collides with a network this
    /// environment does not own.
    async fn check_address_space(&self) -> Result<()> {
        match self.tools.cloud.describe_vpcs(&self.env.params.region).await {
            Ok(existing) => {
                check_overlap(&self.env.network.cidr, &self.env.params, &existing)?;
                ui::print_progress(&format!(
                    "address block {} is free in {}",
                    self.env.network.cidr, self.env.params.region
                ));
                Ok(())
            }
            Err(ProvisionError::MissingTool(tool)) => {
                warn!(tool, "Cloud CLI not available, skipping address overlap check");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Converge an initialized stage, recording it as created by `run` when
    /// its state held no outputs beforehand.
    async fn converge_stage(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        dir: &Path,
    ) -> Result<Convergence> {
        let existed = !self.tools.engine.output(stage, dir).await?.is_empty();
        let outcome = converge(self.tools.engine.as_ref(), stage, dir).await;
        // A failed apply can still leave resources behind
        if !existed && !matches!(outcome, Ok(Convergence::Unchanged)) {
            run.mark_created(stage)?;
        }
        outcome
    }

    async fn provision_network(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
    ) -> Result<NetworkOutputs> {
        let dir = self.prepare_stage(Stage::Network, None).await?;
        let outcome = self.converge_stage(run, Stage::Network, &dir).await?;
        ui::print_convergence("network", outcome);
        ctx.convergence.push((Stage::Network, outcome));

        let raw = self.tools.engine.output(Stage::Network, &dir).await?;
        let network = NetworkOutputs::from_raw(&raw)?;
        info!(
            vpc_id = %network.vpc_id,
            private_subnets = network.private_subnets.len(),
            public_subnets = network.public_subnets.len(),
            "Network ready"
        );
        Ok(network)
    }

    async fn provision_cluster(
        &self,
        run: &mut PipelineRun,
        network: &NetworkOutputs,
        ctx: &mut RunContext,
    ) -> Result<ClusterOutputs> {
        let dir = self.prepare_stage(Stage::Cluster, Some(network)).await?;
        let outcome = self.converge_stage(run, Stage::Cluster, &dir).await?;
        ui::print_convergence("cluster", outcome);
        ctx.convergence.push((Stage::Cluster, outcome));

        let raw = self.tools.engine.output(Stage::Cluster, &dir).await?;
        let cluster = ClusterOutputs::from_raw(&raw)?;
        info!(
            cluster = %cluster.cluster_name,
            endpoint = %cluster.cluster_endpoint,
            profiles = ?cluster.fargate_profile_names,
            "Cluster created"
        );

        self.tools
            .cloud
            .update_kubeconfig(
                &self.env.params.cluster_name,
                &self.env.params.region,
                Some(&self.kubeconfig()),
            )
            .await?;
        Ok(cluster)
    }

    async fn wait_cluster_ready(&self) -> Result<()> {
        let expected = usize::try_from(self.env.cluster.worker_count).unwrap_or(usize::MAX);
        let kubeconfig = self.kubeconfig();
        let observer = &self.tools.observer;
        let ready = poll_until(
            "worker nodes",
            Duration::from_secs(self.env.cluster.ready_timeout_secs),
            self.poll_interval,
            || observer.ready_workers(&kubeconfig),
            |ready| *ready >= expected,
        )
        .await?;
        if ready < expected {
            return Err(ProvisionError::ClusterNotReady { ready, expected });
        }
        ui::print_progress(&format!("{ready}/{expected} worker nodes Ready"));
        Ok(())
    }

    async fn deploy_database(&self, run: &mut PipelineRun) -> Result<()> {
        let release = &self.env.database;
        let kubeconfig = self.kubeconfig();

        if !self
            .tools
            .observer
            .storage_class_exists(&kubeconfig, &release.storage_class)
            .await?
        {
            return Err(ProvisionError::StorageUnavailable(
                release.storage_class.clone(),
            ));
        }

        let values = write_values(
            &self.env.stage_dir(&self.work_dir, Stage::Database),
            release,
        )?;
        self.tools.deployer.add_repo(release).await?;
        if !self.tools.deployer.is_installed(release, &kubeconfig).await? {
            run.mark_created(Stage::Database)?;
        }
        self.tools
            .deployer
            .upgrade_install(release, &values, &kubeconfig)
            .await?;
        ui::print_progress(&format!(
            "{} {} installed in namespace {}",
            release.chart, release.chart_version, release.namespace
        ));
        Ok(())
    }

    /// Wait for the release to report every replica ready with a bound
    /// volume. On failure, returns the last report alongside the error.
    async fn wait_database_ready(
        &self,
    ) -> std::result::Result<ReadinessReport, (Option<ReadinessReport>, ProvisionError)> {
        let release = &self.env.database;
        let kubeconfig = self.kubeconfig();
        let observer = &self.tools.observer;
        let report = poll_until(
            "database replicas",
            Duration::from_secs(release.ready_timeout_secs),
            self.poll_interval,
            || observer.database_readiness(&kubeconfig, release),
            ReadinessReport::is_ready,
        )
        .await
        .map_err(|e| (None, e))?;

        ui::print_readiness(&report);
        if report.is_ready() {
            Ok(report)
        } else {
            let e = report.to_error();
            Err((Some(report), e))
        }
    }

    async fn configure_access(
        &self,
        cluster: &ClusterOutputs,
        options: &RunOptions,
    ) -> Result<Option<PathBuf>> {
        self.tools
            .cloud
            .update_kubeconfig(&cluster.cluster_name, &self.env.params.region, None)
            .await?;
        ui::print_progress(&format!(
            "kubeconfig updated for {}",
            cluster.cluster_name
        ));
        let written = emit_output(
            CLUSTER_ENDPOINT,
            &cluster.cluster_endpoint,
            options.output_file.as_deref(),
        )?;
        println!("{CLUSTER_ENDPOINT}={}", cluster.cluster_endpoint);
        Ok(written)
    }

    /// Remove the environment: database, then cluster, then network.
    ///
    /// # Errors
    ///
    /// Returns `Lease` if another run holds the environment, or the first
    /// teardown error.
    pub async fn destroy(&self) -> Result<Vec<Stage>> {
        let lease = self.acquire_lease(&uuid::Uuid::new_v4().to_string())?;
        let mut removed = Vec::new();
        let mut result = Ok(());
        for stage in Stage::ALL.iter().rev() {
            ui::print_progress(&format!("tearing down {stage}"));
            if let Err(e) = self.destroy_stage(*stage).await {
                result = Err(e);
                break;
            }
            removed.push(*stage);
        }
        if let Err(e) = lease.release() {
            if result.is_ok() {
                return Err(e.into());
            }
            warn!(error = %e, "Failed to release state lease");
        }
        result.map(|()| removed)
    }

    /// Tear down what the failed run created, newest first. Stages that
    /// existed before the run are kept. Errors are logged; the original
    /// failure is what the caller reports.
    async fn rollback(&self, run: &mut PipelineRun) {
        let created: Vec<Stage> = run.created_stages.iter().rev().copied().collect();
        if created.is_empty() {
            ui::print_info("Nothing was created by this run, keeping existing stages.");
            return;
        }
        ui::print_warning("Rolling back stages created by this run");
        for stage in created {
            match self.destroy_stage(stage).await {
                Ok(()) => {
                    info!(%stage, "Rolled back stage");
                    run.rolled_back.push(stage);
                }
                Err(e) => {
                    error!(%stage, error = %e, "Rollback failed, leaving remaining stages");
                    ui::print_error(&format!("Rollback of {stage} failed: {e}"));
                    break;
                }
            }
        }
        if let Err(e) = run.save() {
            warn!(error = %e, "Failed to save run record after rollback");
        }
    }

    async fn destroy_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Database => self.uninstall_database().await,
            Stage::Cluster => {
                let network = self.existing_network().await?;
                let dir = self.prepare_stage(Stage::Cluster, network.as_ref()).await?;
                // Without a network the cluster can only exist if its state
                // still records outputs
                if network.is_none()
                    && self.tools.engine.output(Stage::Cluster, &dir).await?.is_empty()
                {
                    info!("Network and cluster absent, nothing to destroy");
                    return Ok(());
                }
                self.tools.engine.destroy(Stage::Cluster, &dir).await
            }
            Stage::Network => {
                let dir = self.prepare_stage(Stage::Network, None).await?;
                self.tools.engine.destroy(Stage::Network, &dir).await
            }
        }
    }

    async fn uninstall_database(&self) -> Result<()> {
        let network = self.existing_network().await?;
        let dir = self.prepare_stage(Stage::Cluster, network.as_ref()).await?;
        let raw = self.tools.engine.output(Stage::Cluster, &dir).await?;
        if !raw.contains_key("cluster_endpoint") {
            info!("Cluster does not exist, nothing to uninstall");
            return Ok(());
        }

        let kubeconfig = self.kubeconfig();
        self.tools
            .cloud
            .update_kubeconfig(
                &self.env.params.cluster_name,
                &self.env.params.region,
                Some(&kubeconfig),
            )
            .await?;
        let release = &self.env.database;
        self.tools.deployer.uninstall(release, &kubeconfig).await?;
        match self.tools.observer.delete_claims(&kubeconfig, release).await {
            Ok(n) => info!(claims = n, "Deleted database volume claims"),
            Err(e) => warn!(error = %e, "Failed to delete database volume claims"),
        }
        Ok(())
    }

    /// Re-evaluate database readiness once.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be reached.
    pub async fn verify_database(&self) -> Result<ReadinessReport> {
        let kubeconfig = self.kubeconfig();
        if !kubeconfig.exists() {
            self.tools
                .cloud
                .update_kubeconfig(
                    &self.env.params.cluster_name,
                    &self.env.params.region,
                    Some(&kubeconfig),
                )
                .await?;
        }
        self.tools
            .observer
            .database_readiness(&kubeconfig, &self.env.database)
            .await
    }

    fn acquire_lease(&self, run_id: &str) -> Result<StateLease> {
        Ok(StateLease::acquire(
            self.leases.clone(),
            &self.env.lease_key(),
            &self.holder,
            run_id,
            self.lease_duration,
        )?)
    }

    fn kubeconfig(&self) -> PathBuf {
        self.env.kubeconfig_path(&self.work_dir)
    }

    fn write_stage(&self, stage: Stage, network: Option<&NetworkOutputs>) -> Result<PathBuf> {
        let dir = self.env.stage_dir(&self.work_dir, stage);
        let stack = match stage {
            Stage::Network => render_network(&self.env),
            Stage::Cluster => match network {
                Some(network) => render_cluster(&self.env, network),
                None => render_cluster_detached(&self.env),
            },
            Stage::Database => {
                write_values(&dir, &self.env.database)?;
                return Ok(dir);
            }
        };
        write_stack(&dir, &stack)?;
        Ok(dir)
    }

    async fn prepare_stage(&self, stage: Stage, network: Option<&NetworkOutputs>) -> Result<PathBuf> {
        let dir = self.write_stage(stage, network)?;
        self.tools
            .engine
            .init(stage, &dir, &self.env.remote_state(stage)?)
            .await?;
        Ok(dir)
    }

    /// Network outputs for setup and teardown. A state with partial outputs,
    /// as left by an interrupted apply, counts as no usable network.
    async fn existing_network(&self) -> Result<Option<NetworkOutputs>> {
        let dir = self.prepare_stage(Stage::Network, None).await?;
        match self.network_outputs(&dir).await {
            Err(ProvisionError::MissingOutput { name, .. }) => {
                warn!(output = %name, "Network state is incomplete");
                Ok(None)
            }
            other => other,
        }
    }

    async fn network_outputs(&self, dir: &Path) -> Result<Option<NetworkOutputs>> {
        let raw = self.tools.engine.output(Stage::Network, dir).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(NetworkOutputs::from_raw(&raw)?))
    }
}

fn missing(stage: Stage, name: &str) -> ProvisionError {
    ProvisionError::MissingOutput {
        stage: stage.to_string(),
        name: name.to_string(),
    }
}

/// Print the outcome of a successful run.
pub fn print_run_summary(summary: &RunSummary, env: &ResolvedEnvironment) {
    ui::print_section("Environment Ready");
    ui::print_kv("Environment", &env.params.env_prefix);
    ui::print_kv("Run", &summary.run_id);
    ui::print_kv("VPC", &summary.network.vpc_id);
    ui::print_kv("Cluster", &summary.cluster.cluster_name);
    ui::print_kv("Endpoint", &summary.cluster.cluster_endpoint);
    ui::print_kv(
        "Serverless profiles",
        &summary.cluster.fargate_profile_names.join(", "),
    );
    ui::print_kv("Database", &summary.database.to_string());
    if let Some(ref path) = summary.output_file {
        ui::print_kv("Outputs written to", &path.display().to_string());
    }
    println!();
}
