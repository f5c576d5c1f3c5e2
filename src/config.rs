//! Controller manager options
//!
//! Options come from three layers, later layers winning: an optional TOML
//! file, the command line (with environment fallbacks), and the lattice's
//! Config object read once at startup.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cloudprovider::{AwsOptions, CloudProviderOptions, LocalOptions};
use crate::crd::meta::{internal_namespace, CONFIG_NAME};
use crate::crd::Config;
use crate::error::{Error, Result};
use crate::iac::{BackendConfig, TerraformOptions};
use crate::servicemesh::{EnvoyOptions, ServiceMeshOptions};
use crate::store::{Selector, Store};
use crate::telemetry::LogFormat;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_WORK_DIRECTORY: &str = "/var/lib/lattice/terraform";

/// Names accepted by `--controllers`
pub const CONTROLLER_NAMES: &[&str] = &[
    "system",
    "build",
    "container-build",
    "deploy",
    "teardown",
    "service",
    "job",
    "node-pool",
    "address",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Kubernetes,
    /// Everything in process: memory store, memory orchestrator
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProviderName {
    Aws,
    Local,
}

/// `run` subcommand arguments
#[derive(Args, Clone, Debug, Default)]
pub struct RunArgs {
    /// Lattice this manager reconciles
    #[arg(long, env = "LATTICE_ID")]
    pub lattice_id: Option<String>,

    /// TOML file with static options
    #[arg(long, env = "LATTICE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, env = "LATTICE_BACKEND")]
    pub backend: Option<Backend>,

    #[arg(long, value_enum, env = "LATTICE_CLOUD_PROVIDER")]
    pub cloud_provider: Option<CloudProviderName>,

    /// Reconcile workers per controller
    #[arg(long, env = "LATTICE_WORKERS")]
    pub workers: Option<usize>,

    /// Comma-separated controllers to run, or `*`
    #[arg(long, env = "LATTICE_CONTROLLERS")]
    pub controllers: Option<String>,

    /// Root of the IaC engine working directories
    #[arg(long, env = "LATTICE_WORK_DIRECTORY")]
    pub work_directory: Option<PathBuf>,

    #[arg(long, env = "TERRAFORM_BINARY")]
    pub terraform_binary: Option<PathBuf>,

    #[arg(long, env = "TERRAFORM_MODULE_PATH")]
    pub terraform_module_path: Option<PathBuf>,

    /// Base directory for relative `file://` definition URLs
    #[arg(long, env = "LATTICE_DEFINITIONS_PATH")]
    pub definitions_path: Option<PathBuf>,

    /// Record IaC engine invocations instead of running them
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    #[arg(long, value_enum, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    #[arg(long, env = "HEALTH_PORT")]
    pub health_port: Option<u16>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TerraformFileOptions {
    pub binary: Option<PathBuf>,
    pub module_path: Option<PathBuf>,
    pub backend: Option<BackendConfig>,
    pub timeout_seconds: Option<u64>,
}

/// Layout of the TOML options file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileOptions {
    pub lattice_id: Option<String>,
    pub backend: Option<Backend>,
    pub cloud_provider: Option<CloudProviderName>,
    pub workers: Option<usize>,
    pub controllers: Option<Vec<String>>,
    pub work_directory: Option<PathBuf>,
    pub definitions_path: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub log_format: Option<LogFormat>,
    pub otel_endpoint: Option<String>,
    pub health_port: Option<u16>,
    pub aws: Option<AwsOptions>,
    pub local: Option<LocalOptions>,
    pub envoy: Option<EnvoyOptions>,
    #[serde(default)]
    pub terraform: TerraformFileOptions,
}

impl FileOptions {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigError(format!("invalid options file: {e}")))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnabledControllers {
    All,
    Only(BTreeSet<String>),
}

impl EnabledControllers {
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let names: Vec<&str> = names
            .iter()
            .map(|n| n.as_ref().trim())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() || names.contains(&"*") {
            return Ok(Self::All);
        }
        let mut enabled = BTreeSet::new();
        for name in names {
            if !CONTROLLER_NAMES.contains(&name) {
                return Err(Error::ConfigError(format!("unknown controller {name:?}")));
            }
            enabled.insert(name.to_string());
        }
        Ok(Self::Only(enabled))
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

impl fmt::Display for EnabledControllers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Only(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

/// Fully resolved options
#[derive(Clone, Debug)]
pub struct Options {
    pub lattice_id: String,
    pub backend: Backend,
    pub cloud_provider: CloudProviderOptions,
    pub service_mesh: ServiceMeshOptions,
    pub workers: usize,
    pub controllers: EnabledControllers,
    pub terraform: TerraformOptions,
    pub definitions_path: Option<PathBuf>,
    pub dry_run: bool,
    pub log_format: LogFormat,
    pub otel_endpoint: Option<String>,
    pub health_port: u16,
}

impl Options {
    /// Read the options file named by `args`, if any, and merge
    pub fn load(args: &RunArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileOptions::read(path)?,
            None => FileOptions::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: &RunArgs, file: FileOptions) -> Result<Self> {
        let lattice_id = args
            .lattice_id
            .clone()
            .or(file.lattice_id)
            .ok_or_else(|| Error::ConfigError("lattice ID is required".to_string()))?;

        let controllers = match (&args.controllers, &file.controllers) {
            (Some(raw), _) => EnabledControllers::parse(&raw.split(',').collect::<Vec<_>>())?,
            (None, Some(names)) => EnabledControllers::parse(names)?,
            (None, None) => EnabledControllers::All,
        };

        let mut terraform = TerraformOptions::default();
        if let Some(dir) = args.work_directory.clone().or(file.work_directory) {
            terraform.work_root = dir;
        } else {
            terraform.work_root = PathBuf::from(DEFAULT_WORK_DIRECTORY);
        }
        if let Some(binary) = args.terraform_binary.clone().or(file.terraform.binary) {
            terraform.binary = binary;
        }
        if let Some(seconds) = file.terraform.timeout_seconds {
            terraform.timeout = Duration::from_secs(seconds);
        }

        let provider = args
            .cloud_provider
            .or(file.cloud_provider)
            .ok_or_else(|| Error::ConfigError("cloud provider is required".to_string()))?;
        let cloud_provider = match provider {
            CloudProviderName::Aws => {
                let mut aws = file.aws.ok_or_else(|| {
                    Error::ConfigError("cloud provider aws needs an [aws] section".to_string())
                })?;
                if let Some(path) = args
                    .terraform_module_path
                    .clone()
                    .or(file.terraform.module_path)
                {
                    aws.terraform_module_path = path;
                }
                if let Some(backend) = file.terraform.backend {
                    aws.terraform_backend = backend;
                }
                CloudProviderOptions {
                    aws: Some(aws),
                    local: None,
                }
            }
            CloudProviderName::Local => CloudProviderOptions {
                aws: None,
                local: Some(file.local.unwrap_or_default()),
            },
        };

        let workers = args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(Error::ConfigError("workers must be at least 1".to_string()));
        }

        Ok(Self {
            lattice_id,
            backend: args.backend.or(file.backend).unwrap_or_default(),
            cloud_provider,
            service_mesh: ServiceMeshOptions {
                envoy: Some(file.envoy.unwrap_or_default()),
            },
            workers,
            controllers,
            terraform,
            definitions_path: args.definitions_path.clone().or(file.definitions_path),
            dry_run: args.dry_run || file.dry_run.unwrap_or(false),
            log_format: args.log_format.or(file.log_format).unwrap_or_default(),
            otel_endpoint: args.otel_endpoint.clone().or(file.otel_endpoint),
            health_port: args
                .health_port
                .or(file.health_port)
                .unwrap_or(DEFAULT_HEALTH_PORT),
        })
    }

    /// Overlay the lattice's Config object
    pub fn with_lattice_config(&self, config: &Config) -> Result<Self> {
        config.spec.validate()?;
        let mut merged = self.clone();
        merged.cloud_provider = self.cloud_provider.overlay(&config.spec.cloud_provider)?;
        merged.service_mesh = self.service_mesh.overlay(&config.spec.service_mesh);
        Ok(merged)
    }
}

/// Read the lattice's Config singleton. More than one Config in the
/// internal namespace is a fatal configuration error.
pub async fn read_lattice_config(store: &Store, lattice_id: &str) -> Result<Option<Config>> {
    let namespace = internal_namespace(lattice_id);
    let mut configs = store
        .api::<Config>()
        .list(Some(&namespace), &Selector::everything())
        .await?;
    match configs.len() {
        0 => Ok(None),
        1 => {
            let config = configs.remove(0);
            let name = config.metadata.name.clone().unwrap_or_default();
            if name != CONFIG_NAME {
                warn!(%name, expected = CONFIG_NAME, "Lattice config has an unexpected name");
            }
            info!(%namespace, "Read lattice config");
            Ok(Some(config))
        }
        n => Err(Error::ConfigError(format!(
            "found {n} Config objects in {namespace}, expected at most one"
        ))),
    }
}
