//! Echo Worker Service
//!
//! Consumes a durable RabbitMQ queue and answers every request with its own
//! payload, after an optional simulated processing delay.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue (RABBITMQ_QUEUE, durable)
//!   ↓ (manual ack, prefetch RABBITMQ_PREFETCH)
//! AmqpWorker<EchoHandler>
//!   ↓ (reply with the request's correlation id)
//! reply_to queue of the caller
//! ```
//!
//! ## Environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RABBITMQ_URL` | `amqp://localhost` |
//! | `RABBITMQ_QUEUE` | `queue_example` |
//! | `RABBITMQ_PREFETCH` | `10` |
//! | `SHUTDOWN_TIMEOUT_SECS` | `30` |
//! | `ECHO_DELAY_MS` | `1000` |
//! | `METRICS_PORT` | unset (exporter disabled) |

use amqp_worker::{
    AmqpWorker, EchoHandler, MessageHandler, WorkerConfig, WorkerError, init_metrics,
};
use core_config::{Environment, FromEnv, amqp::AmqpConfig, app_info, env_parse};
use eyre::{Result, WrapErr};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_ECHO_DELAY_MS: u64 = 1000;

/// Run the echo worker until SIGINT/SIGTERM or a fatal broker error.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration variables are present but unparsable
/// - The metrics exporter cannot be installed
/// - The broker is unreachable or the queue cannot be declared
/// - The worker loses its channel or subscription while running
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting echo worker");
    info!("Environment: {:?}", environment);

    let config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let delay_ms: u64 = env_parse("ECHO_DELAY_MS", DEFAULT_ECHO_DELAY_MS)
        .wrap_err("Failed to load echo delay")?;

    if let Some(port) = config.metrics_port {
        init_metrics(SocketAddr::from(([0, 0, 0, 0], port)))
            .wrap_err("Failed to install Prometheus exporter")?;
    }

    info!(
        url = %config.redacted_url(),
        queue = %config.queue,
        prefetch = config.prefetch,
        delay_ms,
        "Connecting to RabbitMQ..."
    );
    let worker = AmqpWorker::connect(
        &config.url,
        WorkerConfig::new(&config.queue).with_prefetch(config.prefetch),
        EchoHandler::with_delay(Duration::from_millis(delay_ms)),
    )
    .await
    .wrap_err_with(|| format!("Failed to connect to {}", config.redacted_url()))?;

    worker.run().await.wrap_err("Failed to start consuming")?;
    info!(queue = %config.queue, "Waiting for messages");

    serve(&worker, shutdown_signal(), config.shutdown_timeout).await?;

    info!("Echo worker stopped");
    Ok(())
}

/// Wait for `shutdown` or a fatal worker error, then drain and stop.
///
/// The drain is bounded by `shutdown_timeout`; a worker that does not finish
/// in time is abandoned with a warning. A fatal error is returned after the
/// worker has been stopped.
pub async fn serve<H, F>(
    worker: &AmqpWorker<H>,
    shutdown: F,
    shutdown_timeout: Duration,
) -> Result<()>
where
    H: MessageHandler + 'static,
    F: Future<Output = ()>,
{
    let fatal = match worker.take_fatal_errors() {
        Some(mut rx) => {
            tokio::select! {
                _ = shutdown => {
                    info!("Shutdown signal received");
                    None
                }
                Some(e) = rx.recv() => {
                    error!(error = %e, "Worker failed");
                    Some(e)
                }
            }
        }
        None => {
            shutdown.await;
            None
        }
    };

    if tokio::time::timeout(shutdown_timeout, worker.stop())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            in_flight = worker.state().in_flight(),
            "Shutdown timed out; abandoning in-flight messages"
        );
    }

    match fatal {
        Some(e) => Err(fatal_report(e)),
        None => Ok(()),
    }
}

fn fatal_report(error: WorkerError) -> eyre::Report {
    eyre::Report::new(error).wrap_err("Worker stopped after a fatal broker error")
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
