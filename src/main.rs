use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::{watcher, Controller};
use kube::api::ListParams;
use kube::{Api, Client};
use std::sync::Arc;
use stride::config::ControllerConfig;
use stride::controller::{error_policy, reconcile, Context};
use stride::crd::rollout::Rollout;
use stride::server::{
    create_metrics, run_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting stride batch rollout controller");

    let config = match ControllerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid controller configuration");
            return Err(e.into());
        }
    };
    info!(
        controller = %config.controller_name,
        batch_ready_timeout_secs = config.batch_ready_timeout.as_secs(),
        webhook_tls = config.webhook_tls.is_some(),
        "Configuration loaded"
    );

    // kube and axum-server both use rustls; pick the provider once per process
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed (non-fatal)");
    }

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    if config.webhook_tls.is_none() {
        info!("Webhook TLS not configured - serving HTTP only");
    }
    let server = run_server(
        config.health_port,
        readiness.clone(),
        metrics.clone(),
        config.webhook_tls.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!(error = %e, "HTTP server failed");
        }
    });

    let ctx = Arc::new(Context::new(client.clone(), &config, Some(metrics)));

    let rollouts = Api::<Rollout>::all(client.clone());
    let deployments = Api::<Deployment>::all(client);

    // The watcher retries forever on a missing CRD; fail fast instead
    if let Err(e) = rollouts.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "Rollout CRD is not served, is it installed?");
        return Err(e.into());
    }

    readiness.mark_watching();
    info!(phase = readiness.phase().as_str(), "Controller ready, starting reconciliation loop");

    // error_policy already logs failures, so only successes are logged here
    let controller = Controller::new(rollouts, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .graceful_shutdown_on(shutdown_signal.triggered())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((rollout, action)) = res {
                info!(rollout = %rollout.name, action = ?action, "Reconciled");
            }
        });
    let mut controller_handle = tokio::spawn(controller);

    tokio::select! {
        _ = &mut controller_handle => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
            }
            // Stop receiving webhook traffic while in-flight reconciles drain
            readiness.mark_draining();
            shutdown_controller.shutdown();
            if let Err(e) = controller_handle.await {
                warn!(error = %e, "Controller task ended abnormally");
            }
        }
    }

    health_handle.abort();

    info!("stride controller shut down gracefully");
    Ok(())
}
