//! meshops operator - managed mesh-manager addon lifecycle

mod config;
mod inspect;

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use meshops_addon::{
    AddonController, ControllerConfig, KubeAddonDeployer, KubeResourceCache, KubeResourceWriter,
};
use meshops_clients::{
    ClusterConnectionResolver, KubeClientCache, KubeClientFactory, MeshClientCache,
    MeshClientFactory, MeshKind,
};
use meshops_common::crd::MeshAddon;
use meshops_common::kube_utils::create_client;
use meshops_common::telemetry::{init_telemetry, TelemetryConfig};
use meshops_common::FIELD_MANAGER;
use meshops_topology::{HttpTopologyRegistry, TopologyCache};

use crate::config::{Cli, Command};
use crate::inspect::{mesh_resources, render_resources, TopologyReport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    match cli.command() {
        Command::Crd => {
            let crd = serde_yaml::to_string(&MeshAddon::crd())
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Command::Run { skip_crd_install } => {
            init_telemetry(TelemetryConfig {
                service_name: "meshops-operator".to_string(),
                ..Default::default()
            })?;
            run_controller(&cli, skip_crd_install).await
        }
        Command::Topology { mesh } => show_topology(&cli, &mesh).await,
        Command::MeshResources {
            mesh,
            kind,
            namespace,
        } => show_mesh_resources(&cli, &mesh, kind, namespace.as_deref()).await,
    }
}

/// Run the MeshAddon controller until SIGINT/SIGTERM
async fn run_controller(cli: &Cli, skip_crd_install: bool) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    if !skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let resolver: Arc<dyn ClusterConnectionResolver> = Arc::new(cli.connection_resolver(&client)?);
    let clients = Arc::new(KubeClientCache::new(resolver, KubeClientFactory));

    let mut deployer = KubeAddonDeployer::new(clients, cli.image_repository.clone());
    if let Some(url) = &cli.topology_url {
        deployer = deployer.with_topology(topology_cache(url)?);
        info!(registry = %url, "mesh topology enabled");
    }

    let (cache, source) = KubeResourceCache::new();
    let controller = Arc::new(AddonController::new(
        Arc::new(cache),
        Arc::new(KubeResourceWriter::new(client.clone())),
        Arc::new(deployer),
        ControllerConfig::default(),
    ));

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_signal(stop.clone()));

    let api: Api<MeshAddon> = Api::all(client);
    let watch = tokio::spawn(source.into_driver(controller.clone()).run(api, stop.clone()));

    info!(workers = cli.workers, resolver = ?cli.resolver, "starting meshops operator");
    controller.run(cli.workers, stop).await;

    watch
        .await
        .map_err(|e| anyhow::anyhow!("watch task panicked: {}", e))?;
    info!("meshops operator stopped");
    Ok(())
}

/// Apply the MeshAddon CRD so its schema always matches this binary
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = MeshAddon::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    crds.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;

    info!(crd = %name, "MeshAddon CRD installed/updated");
    Ok(())
}

fn topology_cache(url: &str) -> anyhow::Result<Arc<TopologyCache>> {
    let registry = HttpTopologyRegistry::new(url)?;
    Ok(meshops_topology::shared(|| TopologyCache::new(Arc::new(registry))))
}

fn require_topology_url(cli: &Cli) -> anyhow::Result<&str> {
    cli.topology_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--topology-url is required to inspect a mesh"))
}

async fn show_topology(cli: &Cli, mesh: &str) -> anyhow::Result<()> {
    let topology = topology_cache(require_topology_url(cli)?)?;

    let report = TopologyReport::load(&topology, mesh).await;
    if report.is_empty() {
        anyhow::bail!("mesh {} not found in the topology registry", mesh);
    }
    print!("{report}");
    Ok(())
}

async fn show_mesh_resources(
    cli: &Cli,
    mesh: &str,
    kind: MeshKind,
    namespace: Option<&str>,
) -> anyhow::Result<()> {
    let topology = topology_cache(require_topology_url(cli)?)?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let resolver: Arc<dyn ClusterConnectionResolver> = Arc::new(cli.connection_resolver(&client)?);
    let clients = MeshClientCache::new(resolver, MeshClientFactory);

    let results = mesh_resources(&topology, &clients, mesh, kind, namespace).await;
    if results.is_empty() {
        anyhow::bail!("mesh {} has no primary clusters", mesh);
    }
    print!("{}", render_resources(kind, &results));
    Ok(())
}

/// Cancel `stop` on SIGINT or SIGTERM
async fn shutdown_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    stop.cancel();
}
