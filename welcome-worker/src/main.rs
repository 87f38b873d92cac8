//! Claim new users in batches, send them a welcome notification, and mark them done.
use std::future::ready;

use axum::{routing, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use welcome_common::metrics::{serve, setup_metrics_routes};
use welcome_worker::config::Config;
use welcome_worker::error::WorkerError;
use welcome_worker::notifier::build_sender;
use welcome_worker::pool::WorkerPool;
use welcome_worker::store::build_store;

async fn index() -> &'static str {
    "welcome users worker"
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler, only listening for SIGINT");
            if let Err(error) = ctrl_c.await {
                error!(%error, "failed to listen for SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env()
        .map_err(|error| WorkerError::ConfigurationError(error.to_string()))?;
    config.validate()?;

    let store = build_store(&config).await?;

    let sender = build_sender(&config.notification)
        .map_err(|error| WorkerError::ConfigurationError(error.to_string()))?;

    let liveness = HealthRegistry::new("liveness");
    let pool = WorkerPool::new(
        store,
        sender,
        liveness.clone(),
        config.poll_interval.0,
        config.liveness_deadline.0,
    )
    .with_janitor(config.janitor_settings());
    let handle = pool.start(
        config.worker_count,
        config.batch_size,
        CancellationToken::new(),
    );

    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    let mut server = tokio::spawn(async move { serve(router, &bind).await });

    let result = tokio::select! {
        _ = wait_for_shutdown_signal() => Ok(()),
        served = &mut server => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                error!(%error, "liveness and metrics server failed");
                Err(WorkerError::ServerError(error))
            }
            Err(error) => {
                error!(%error, "liveness and metrics server task failed");
                Ok(())
            }
        },
    };

    info!("shutting down workers");
    handle.shutdown().await;
    server.abort();

    result
}
