pub mod conf;
pub mod health;
pub mod logging;
pub mod processor;
pub mod relay;
pub mod transform;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

pub use crate::conf::{Config, OAuthConfig, TlsConfig};
pub use crate::health::{HealthState, HealthStatus, SharedHealthState, run_health_server};
pub use crate::logging::{LogFormat, init_logging};
pub use crate::processor::{EventProcessor, ProcessError};
pub use crate::relay::EventRelay;
pub use crate::transform::{Message, MessageTransformer};

/// Run the relay forever, rebuilding it after every failure.
///
/// Consumption restarts from the last committed offset, so anything that was
/// in flight when the relay failed is delivered again.
///
/// # Errors
/// The loop itself does not give up; the `Result` exists so callers can
/// compose it with other fallible tasks.
pub async fn run_with_recovery(
    config: Config,
    health_state: SharedHealthState,
    transformer: Arc<dyn MessageTransformer>,
) -> Result<()> {
    const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    loop {
        info!(event = "relay_creating", "Creating event relay");

        let relay_result =
            EventRelay::new(config.clone(), health_state.clone(), transformer.clone()).await;

        match relay_result {
            Ok(relay) => {
                info!(
                    event = "relay_created",
                    status = "success",
                    "Relay created successfully, starting message processing"
                );

                match relay.run().await {
                    Ok(()) => {
                        warn!(
                            event = "relay_stopped",
                            reason = "normal",
                            "Relay stopped normally (unexpected)"
                        );
                    }
                    Err(e) => {
                        error!(
                            event = "relay_error",
                            error = %format!("{e:#}"),
                            "Relay encountered an error"
                        );
                    }
                }

                info!(
                    event = "relay_reconnecting",
                    delay_secs = RECONNECT_DELAY.as_secs(),
                    "Connection lost or error occurred, will attempt to reconnect"
                );
            }
            Err(e) => {
                error!(
                    event = "relay_creation_failed",
                    error = %format!("{e:#}"),
                    retry_delay_secs = RECONNECT_DELAY.as_secs(),
                    "Failed to create relay"
                );

                health_state.write().await.set(HealthStatus::Unhealthy);
            }
        }

        time::sleep(RECONNECT_DELAY).await;
        info!(event = "reconnect_attempt", "Attempting to reconnect");
    }
}

/// Run the relay and the health server until `shutdown` completes.
///
/// # Errors
/// Returns an error if the health server fails to bind or serve requests.
pub async fn run_relay_until<S>(
    config: Config,
    health_state: SharedHealthState,
    shutdown: S,
    transformer: Arc<dyn MessageTransformer>,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    info!(
        event = "application_starting",
        "Starting Kafka event relay with auto-recovery and health checks"
    );

    info!(
        event = "config_loaded",
        source_topic = %config.source_topic,
        target_topic = %config.target_topic,
        consumer_group = %config.consumer_group,
        processor = %config.processor_name,
        health_port = config.health_port,
        "Configuration loaded"
    );

    info!(
        event = "health_server_starting",
        port = config.health_port,
        "Starting health check server"
    );
    let health_server = run_health_server(config.health_port, health_state.clone());

    let relay = run_with_recovery(config, health_state, transformer);

    tokio::pin!(health_server);
    tokio::pin!(relay);
    tokio::pin!(shutdown);

    tokio::select! {
        result = &mut health_server => {
            error!(
                event = "health_server_failed",
                error = ?result,
                "Health server failed"
            );
            result.context("Health server failed")?;
        }
        result = &mut relay => {
            error!(
                event = "relay_failed",
                error = ?result,
                "Relay failed"
            );
            result.context("Relay failed")?;
        }
        () = &mut shutdown => {
            info!(
                event = "shutdown_signal",
                "Received shutdown signal, exiting gracefully"
            );
        }
    }

    info!(
        event = "application_stopped",
        "Application shutdown complete"
    );

    Ok(())
}

/// Convenience runner that waits for Ctrl-C or SIGTERM and then shuts down.
///
/// # Errors
/// Propagates any errors from [`run_relay_until`].
pub async fn run_with_ctrl_c(
    config: Config,
    health_state: SharedHealthState,
    transformer: Arc<dyn MessageTransformer>,
) -> Result<()> {
    run_relay_until(config, health_state, shutdown_signal(), transformer).await
}

async fn shutdown_signal() {
    let ctrl_c = wait_for_signal("SIGINT", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = wait_for_signal("SIGTERM", async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Resolve when `signal` fires. A handler that fails to install never resolves,
/// so it cannot be mistaken for a shutdown request.
async fn wait_for_signal<F>(name: &str, signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(signal = name, error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
    }
}
