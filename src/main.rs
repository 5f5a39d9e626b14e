//! # Service Exposer Controller
//!
//! Binary entry point: wires the cluster-backed watch source, the Service
//! write path and the controller pipeline together, starts the probe
//! server, and runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{api::Api, Client};
use service_exposer_controller::controller::{Controller, DEFAULT_WORKERS};
use service_exposer_controller::server::{start_server, ServerState};
use service_exposer_controller::service::KubeServiceWriter;
use service_exposer_controller::watch::{deployment_watch, DeploymentCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "service-exposer-controller", version, about)]
struct Args {
    /// Number of concurrent reconcile workers.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Namespace to watch; watches all namespaces when omitted.
    #[arg(long)]
    namespace: Option<String>,

    /// Seconds to wait for the initial deployment cache sync.
    #[arg(long, default_value_t = 60)]
    cache_sync_timeout_secs: u64,

    /// Port for the liveness/readiness probe server.
    #[arg(long, default_value_t = 8080)]
    probe_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any rustls-backed connection is attempted; rustls
    // 0.23 has no default provider without this.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "service_exposer_controller=info".into()),
        )
        .init();

    let args = Args::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("BUILD_GIT_HASH"),
        built = env!("BUILD_DATETIME"),
        "starting service exposer controller"
    );

    let server_state = Arc::new(ServerState::default());
    let probe_state = Arc::clone(&server_state);
    let probe_port = args.probe_port;
    tokio::spawn(async move {
        if let Err(err) = start_server(probe_port, probe_state).await {
            error!(error = %err, "probe server error");
        }
    });

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let deployments: Api<Deployment> = match &args.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    info!(
        namespace = args.namespace.as_deref().unwrap_or("<all>"),
        "watching deployments"
    );

    let (cache, events) = deployment_watch(deployments);
    let writer = KubeServiceWriter::new(client);

    // Readiness tracks the cache-sync barrier.
    {
        let cache = cache.clone();
        let state = Arc::clone(&server_state);
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_millis(100));
            loop {
                poll.tick().await;
                if cache.has_synced() {
                    state.mark_ready();
                    break;
                }
            }
        });
    }

    let controller = Controller::new(cache, writer)
        .workers(args.workers)
        .sync_timeout(Duration::from_secs(args.cache_sync_timeout_secs));

    controller
        .run(events, shutdown_signal())
        .await
        .context("controller run failed")?;

    info!("controller stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
