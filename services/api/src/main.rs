//! Ingestion REST API for the optiq image optimization service.
//!
//! Accepts JPEG/PNG uploads, persists the original in the object store,
//! records metadata in PostgreSQL, queues an optimization task over RabbitMQ
//! and serves status/listing/deletion endpoints while the worker does the
//! heavy lifting.

mod error;
mod health;
mod images;
mod routes;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use optiq_core::{Config, ImageRepository, ObjectStore};
use optiq_queue::QueueClient;
use routes::AppState;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log.level);

    info!(
        service = "optiq-api",
        version = env!("CARGO_PKG_VERSION"),
        "Starting optiq API"
    );

    let metrics = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    let repo = ImageRepository::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    if config.database.run_migrations {
        repo.run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store = ObjectStore::connect(&config.minio)
        .await
        .context("Failed to initialize object store")?;

    let queue = Arc::new(
        QueueClient::connect(&config.rabbitmq)
            .await
            .context("Failed to connect to RabbitMQ")?,
    );

    let address = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState {
        repo,
        store,
        queue,
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;

    info!(address = %address, "API server listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("API server stopped");

    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
