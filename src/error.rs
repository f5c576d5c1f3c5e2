//! Error types for the lattice controller manager

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the store, the runtime, the controllers and the
/// cloud provisioner
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("Conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The orchestrator refused a workload spec as invalid
    #[error("Orchestrator rejected {name}: {message}")]
    InvalidWorkload { name: String, message: String },

    #[error("Orchestrator error: {0}")]
    OrchestratorError(String),

    #[error("IaC engine {operation} failed in {work_dir}: {message}")]
    IacError {
        operation: String,
        work_dir: String,
        message: String,
    },

    #[error("IaC engine {operation} timed out after {seconds}s in {work_dir}")]
    IacTimeout {
        operation: String,
        work_dir: String,
        seconds: u64,
    },

    #[error("Definition error: {0}")]
    DefinitionError(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl Error {
    /// Whether the failure is expected to clear up on its own
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code >= 500 || e.code == 409 || e.code == 429,
            Error::KubeError(_) => true,
            Error::Conflict { .. } | Error::IacTimeout { .. } | Error::IoError(_) => true,
            Error::OrchestratorError(_) | Error::WatchError(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Short label used for the reconcile error metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::WatchError(_) => "watch",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::IoError(_) => "io",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::InvalidWorkload { .. } => "invalid_workload",
            Error::OrchestratorError(_) => "orchestrator",
            Error::IacError { .. } | Error::IacTimeout { .. } => "iac",
            Error::DefinitionError(_) => "definition",
            Error::Cancelled => "cancelled",
        }
    }
}
