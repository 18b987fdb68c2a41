//! eksprov CLI.
//!
//! Provisions an EKS environment in three stages (network, cluster,
//! database) and runs them non-interactively from a CI pipeline.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::apply::ApplyCommand;
use commands::destroy::DestroyCommand;
use commands::init::InitCommand;
use commands::kubeconfig::KubeconfigCommand;
use commands::pipeline::PipelineCommand;
use commands::plan::PlanCommand;
use commands::profiles::ProfilesCommand;
use commands::render::RenderCommand;
use commands::status::StatusCommand;
use commands::verify::VerifyCommand;
use commands::GlobalArgs;

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// eksprov - EKS environment provisioning.
#[derive(Parser)]
#[command(
    name = "eksprov",
    version,
    about = "Provision EKS environments: network, cluster, database",
    long_about = "Provision an EKS environment in three stages.\n\n\
                  The network stage creates a VPC with private and public subnets,\n\
                  the cluster stage creates an EKS cluster with a managed worker\n\
                  group and one scoped Fargate profile, and the database stage\n\
                  installs a replicated MySQL release.\n\n\
                  Every stage converges: re-running with unchanged parameters\n\
                  changes nothing."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render both stacks and initialize their remote state.
    Init(InitCommand),

    /// Show what apply would change.
    Plan(PlanCommand),

    /// Converge network, cluster and database.
    Apply(ApplyCommand),

    /// Non-interactive full run for CI.
    ///
    /// Requires AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, takes
    /// parameters from TF_VAR_* variables, and publishes cluster_endpoint.
    Pipeline(PipelineCommand),

    /// Tear down an environment.
    Destroy(DestroyCommand),

    /// Merge cluster access into the local kube configuration.
    Kubeconfig(KubeconfigCommand),

    /// List the serverless profiles of a cluster.
    Profiles(ProfilesCommand),

    /// Check serverless profile scoping and database readiness.
    Verify(VerifyCommand),

    /// Show the last recorded run.
    Status(StatusCommand),

    /// Write stacks and chart values without running anything.
    Render(RenderCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,eksprov=debug")
        } else {
            EnvFilter::new("warn,eksprov=info")
        }
    });

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    let global = &cli.global;
    match cli.command {
        Commands::Init(cmd) => cmd.run(global).await,
        Commands::Plan(cmd) => cmd.run(global).await,
        Commands::Apply(cmd) => cmd.run(global).await,
        Commands::Pipeline(cmd) => cmd.run(global).await,
        Commands::Destroy(cmd) => cmd.run(global).await,
        Commands::Kubeconfig(cmd) => cmd.run(global).await,
        Commands::Profiles(cmd) => cmd.run(global).await,
        Commands::Verify(cmd) => cmd.run(global).await,
        Commands::Status(cmd) => cmd.run(global),
        Commands::Render(cmd) => cmd.run(global),
    }
}
