use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::ResourceExt;
use lattice_controller::cloudprovider::new_cloud_provider;
use lattice_controller::config::{read_lattice_config, Backend, Options, RunArgs};
use lattice_controller::controller::{self, Context, DEFAULT_TEARDOWN_TIMEOUT};
use lattice_controller::crd::meta::{internal_namespace, system_id_from_namespace};
use lattice_controller::crd::System;
use lattice_controller::definition::FileResolver;
use lattice_controller::iac::{IacEngine, RecordingEngine, Terraform};
use lattice_controller::orchestrator::{KubeOrchestrator, MemoryOrchestrator, Orchestrator};
use lattice_controller::runtime::{leader, InformerFactory, LeaderElector};
use lattice_controller::servicemesh::new_service_mesh;
use lattice_controller::store::{KubeStore, MemoryStore, Selector, Store};
use lattice_controller::{telemetry, Error};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller manager
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// List the Systems of a lattice
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long, env = "LATTICE_ID")]
    lattice_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Lattice Controller Manager v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_manager(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let store = Store::new(Arc::new(KubeStore::new(client)));
    let systems = store
        .api::<System>()
        .list(None, &Selector::everything())
        .await?;

    let systems: Vec<&System> = systems
        .iter()
        .filter(|s| {
            s.namespace()
                .is_some_and(|ns| system_id_from_namespace(&args.lattice_id, &ns).is_some())
        })
        .collect();
    println!("Systems in lattice {}: {}", args.lattice_id, systems.len());
    for system in systems {
        let status = system.status.clone().unwrap_or_default();
        println!(
            "  {:<24} {:<10?} {}",
            system.name_any(),
            status.state,
            status.version.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_manager(args: RunArgs) -> Result<(), Error> {
    let static_options = Options::load(&args)?;
    telemetry::init_tracing(
        static_options.log_format,
        static_options.otel_endpoint.as_deref(),
    )?;

    info!(
        lattice = %static_options.lattice_id,
        backend = ?static_options.backend,
        "Starting Lattice Controller Manager v{}",
        env!("CARGO_PKG_VERSION")
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                token.cancel();
            }
        });
    }

    let (store, orchestrator, client): (Store, Arc<dyn Orchestrator>, Option<kube::Client>) =
        match static_options.backend {
            Backend::Kubernetes => {
                let client = kube::Client::try_default().await?;
                info!("Connected to Kubernetes cluster");
                (
                    Store::new(Arc::new(KubeStore::new(client.clone()))),
                    Arc::new(KubeOrchestrator::new(client.clone())),
                    Some(client),
                )
            }
            Backend::Memory => (
                Store::new(Arc::new(MemoryStore::new())),
                Arc::new(MemoryOrchestrator::new()),
                None,
            ),
        };

    // Config is read once; changing it needs a restart
    let (options, container_build) =
        match read_lattice_config(&store, &static_options.lattice_id).await? {
            Some(config) => (
                static_options.with_lattice_config(&config)?,
                config.spec.container_build,
            ),
            None => {
                warn!("No lattice Config found, running with static options only");
                (static_options, Default::default())
            }
        };

    let engine: Arc<dyn IacEngine> = if options.dry_run {
        info!("Dry run: IaC invocations are recorded, not executed");
        Arc::new(RecordingEngine::new())
    } else {
        Arc::new(Terraform::new(options.terraform.clone(), token.clone()))
    };
    let cloud_provider = new_cloud_provider(&options.cloud_provider, &options.lattice_id, engine)?;
    let service_mesh = Arc::from(new_service_mesh(&options.service_mesh)?);

    // The memory backend has no competing replicas
    let elector = client.map(|client| {
        let identity = leader::default_identity();
        info!("Leader election using holder ID: {}", identity);
        LeaderElector::new(client, &internal_namespace(&options.lattice_id), identity)
    });
    let is_leader = match &elector {
        Some(elector) => elector.is_leader(),
        None => Arc::new(AtomicBool::new(true)),
    };

    let informers = Arc::new(InformerFactory::new(store.clone()));
    let ctx = Arc::new(Context {
        lattice_id: options.lattice_id.clone(),
        store,
        informers: informers.clone(),
        orchestrator,
        cloud_provider,
        service_mesh,
        resolver: Arc::new(FileResolver::new(options.definitions_path.clone())),
        container_build,
        teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
    });

    #[cfg(feature = "rest-api")]
    {
        let state = Arc::new(lattice_controller::rest_api::HealthState {
            is_leader: is_leader.clone(),
            informers: Some(informers.clone()),
        });
        let port = options.health_port;
        let server_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = lattice_controller::rest_api::run_server(state, port, server_token).await {
                tracing::error!("Health server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = (&is_leader, &informers);

    if let Some(elector) = elector {
        if !elector.acquire(&token).await {
            telemetry::shutdown_telemetry();
            return Ok(());
        }
        tokio::spawn(elector.hold(token.clone()));
    }

    controller::run_controllers(ctx, &options.controllers, options.workers, token).await;

    telemetry::shutdown_telemetry();
    Ok(())
}
