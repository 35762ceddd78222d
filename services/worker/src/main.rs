//! Asynchronous image optimization worker for the optiq service.
//!
//! Consumes resize tasks from RabbitMQ with at-least-once semantics, runs the
//! CPU-bound image work under a bounded semaphore, and drives each image
//! record to a terminal state. Shutdown drains in-flight tasks up to a
//! deadline; anything unfinished stays unacked and is redelivered.

mod worker;

use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use optiq_core::{Config, ImageProcessor, ImageRepository, ObjectStore};
use optiq_queue::QueueClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log.level);

    info!(
        service = "optiq-worker",
        version = env!("CARGO_PKG_VERSION"),
        max_workers = config.worker.max_workers,
        "Starting optiq worker"
    );

    if config.metrics.enabled {
        init_metrics(config.worker.metrics_port)?;
    }

    let repo = ImageRepository::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    let store = ObjectStore::connect(&config.minio)
        .await
        .context("Failed to initialize object store")?;

    let queue = Arc::new(
        QueueClient::connect(&config.rabbitmq)
            .await
            .context("Failed to connect to RabbitMQ")?,
    );

    let shutdown = CancellationToken::new();
    let worker = Arc::new(Worker::new(
        repo,
        ImageProcessor::new(store),
        config.worker.max_workers,
        shutdown.clone(),
    ));

    let mut consume_handle = {
        let queue = queue.clone();
        let worker = worker.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            queue
                .consume(token, move |task| {
                    let worker = worker.clone();
                    async move { worker.handle_task(task).await }
                })
                .await
        })
    };

    info!("Worker started and consuming tasks");

    let consumer_failed = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down worker");
            false
        }
        result = &mut consume_handle => {
            match result {
                Ok(Ok(())) => warn!("Consumer loop exited"),
                Ok(Err(e)) => error!(error = %e, "Consumer loop failed"),
                Err(e) => error!(error = %e, "Consumer task panicked"),
            }
            true
        }
    };

    shutdown.cancel();

    info!(
        in_flight = worker.in_flight(),
        "Waiting for active worker tasks to complete"
    );

    if worker.drain(config.shutdown_timeout()).await {
        info!("All active tasks completed");
    } else {
        warn!(
            deadline_secs = config.worker.shutdown_timeout,
            "Drain deadline exceeded; unacked tasks will be redelivered"
        );
    }

    if !consume_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), consume_handle).await;
    }

    if consumer_failed {
        // Exit non-zero so the supervisor restarts the process; consumer
        // auto-reconnect is deliberately not handled in-process.
        return Err(anyhow!("consumer loop exited unexpectedly"));
    }

    info!("Worker stopped gracefully");
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

/// Start the Prometheus exporter on the worker's own port.
fn init_metrics(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
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
