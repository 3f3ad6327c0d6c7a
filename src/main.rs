//! Expose controller - gives every Deployment a Service and an Ingress

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use expose_controller::cache::ReflectorCache;
use expose_controller::client::KubeClusterClient;
use expose_controller::config::{create_client, resolve_kubeconfig, ControllerConfig};
use expose_controller::controller::{Context, Controller};
use expose_controller::informer::{Informer, QueueEventHandler};
use expose_controller::key::ReconcileKey;
use expose_controller::queue::RateLimitingQueue;
use expose_controller::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::parse();
    init_telemetry(config.log_format)?;
    config.validate()?;

    let kubeconfig = resolve_kubeconfig(config.kubeconfig.as_deref());
    match &kubeconfig {
        Some(path) => tracing::info!(kubeconfig = %path.display(), "using kubeconfig"),
        None => tracing::info!("no kubeconfig found, inferring cluster configuration"),
    }
    let client = create_client(kubeconfig.as_deref())
        .await
        .context("failed to connect to the cluster")?;

    let queue: RateLimitingQueue<ReconcileKey> = RateLimitingQueue::new(config.rate_limiter());
    let informer = Informer::new(client.clone(), config.namespace.as_deref());
    let cache: ReflectorCache = informer.cache();

    let ctx = Context::new(
        Arc::new(KubeClusterClient::new(client)),
        Arc::new(cache),
        queue.clone(),
    )
    .with_route_options(config.route_options());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match &config.namespace {
        Some(ns) => tracing::info!(namespace = %ns, "watching deployments in one namespace"),
        None => tracing::info!("watching deployments in all namespaces"),
    }

    let change_stream = informer.run(Arc::new(QueueEventHandler::new(queue)), shutdown.clone());
    Controller::new(Arc::new(ctx), config.runner_settings())
        .run(change_stream, shutdown)
        .await
        .context("controller failed")?;

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::info!("received SIGINT"),
                Err(e) => {
                    tracing::error!(error = %e, "failed to listen for SIGINT");
                    return;
                }
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("received Ctrl+C");
    }

    shutdown.cancel();
}
