//! Provisioning error taxonomy.
//!
//! Every failure the workflow can surface falls into one of four classes:
//! configuration errors (fatal, operator must correct parameters), transient
//! cloud API errors (retried with backoff by the engine adapter), readiness
//! errors (a stage ran but its workload never became ready) and pipeline
//! errors (an external tool failed, or the environment is locked).

use thiserror::Error;

/// Coarse classification used for retry and exit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid or conflicting parameters. Never retried.
    Configuration,
    /// Throttling and eventual-consistency races. Retried with backoff.
    Transient,
    /// A workload failed to reach its ready state.
    Readiness,
    /// Any other stage failure; halts the pipeline.
    Pipeline,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transient => write!(f, "transient"),
            Self::Readiness => write!(f, "readiness"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// Errors raised by the provisioning workflow.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested address block overlaps an existing network.
    #[error("Address block {cidr} overlaps an existing network: {detail}")]
    AddressOverlap { cidr: String, detail: String },

    /// The requested Kubernetes version is not offered in the region.
    #[error("Kubernetes version {version} is not supported in {region}: {detail}")]
    VersionSkew {
        version: String,
        region: String,
        detail: String,
    },

    /// Two environments would share remote state.
    #[error("State collision: environments '{first}' and '{second}' both use {key}")]
    StateCollision {
        first: String,
        second: String,
        key: String,
    },

    /// The cluster cannot provision persistent volumes of the requested class.
    #[error("Storage class '{0}' is not available in the cluster")]
    StorageUnavailable(String),

    /// Required credentials were not injected.
    #[error("Missing credentials: {0} is not set")]
    MissingCredentials(&'static str),

    /// A required external tool is not installed.
    #[error("Required tool '{0}' was not found on PATH")]
    MissingTool(String),

    /// The cloud API throttled the request.
    #[error("Throttled by cloud API during {stage}: {detail}")]
    Throttled { stage: String, detail: String },

    /// Worker nodes did not register in time.
    #[error("Cluster not ready: {ready}/{expected} worker nodes Ready")]
    ClusterNotReady { ready: usize, expected: usize },

    /// Database replicas did not become ready in time.
    #[error("Database not ready: {ready}/{expected} replicas ready, {bound}/{expected} volumes bound")]
    DatabaseNotReady {
        ready: usize,
        bound: usize,
        expected: usize,
    },

    /// An external tool exited unsuccessfully.
    #[error("{stage}: `{command}` failed: {stderr}")]
    Engine {
        stage: String,
        command: String,
        stderr: String,
    },

    /// A required output was missing from a previous stage.
    #[error("Stage '{stage}' did not produce output '{name}'")]
    MissingOutput { stage: String, name: String },

    /// Another run holds the environment's state lease.
    #[error(transparent)]
    Lease(#[from] crate::lease::LeaseError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ProvisionError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidConfig(_)
            | Self::AddressOverlap { .. }
            | Self::VersionSkew { .. }
            | Self::StateCollision { .. }
            | Self::StorageUnavailable(_)
            | Self::MissingCredentials(_)
            | Self::MissingTool(_) => ErrorClass::Configuration,
            Self::Throttled { .. } => ErrorClass::Transient,
            Self::ClusterNotReady { .. } | Self::DatabaseNotReady { .. } => ErrorClass::Readiness,
            Self::Engine { .. }
            | Self::MissingOutput { .. }
            | Self::Lease(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Kube(_) => ErrorClass::Pipeline,
        }
    }

    /// Whether the engine adapter may retry the failed command.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Convenience alias.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
