use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    pub liveness: HealthStatus,
    pub readiness: HealthStatus,
    pub last_message_processed: Option<Instant>,
    pub messages_relayed: u64,
    /// Messages forwarded unchanged because the transformer could not enrich them.
    pub messages_passed_through: u64,
    /// Payload-less records, forwarded without running the transformer.
    pub tombstones_forwarded: u64,
}

/// How a relayed record left the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Enriched,
    PassedThrough,
    Tombstone,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            liveness: HealthStatus::Starting,
            readiness: HealthStatus::Starting,
            last_message_processed: None,
            messages_relayed: 0,
            messages_passed_through: 0,
            tombstones_forwarded: 0,
        }
    }
}

impl HealthState {
    pub fn set(&mut self, status: HealthStatus) {
        self.liveness = status;
        self.readiness = status;
    }

    pub fn record_delivery(&mut self, delivery: Delivery) {
        self.messages_relayed += 1;
        match delivery {
            Delivery::Enriched => {}
            Delivery::PassedThrough => self.messages_passed_through += 1,
            Delivery::Tombstone => self.tombstones_forwarded += 1,
        }
        self.last_message_processed = Some(Instant::now());
    }
}

pub type SharedHealthState = Arc<RwLock<HealthState>>;

#[derive(Debug, Serialize)]
struct StatusReport {
    liveness: HealthStatus,
    readiness: HealthStatus,
    messages_relayed: u64,
    messages_passed_through: u64,
    tombstones_forwarded: u64,
    last_message_age_ms: Option<u64>,
}

async fn liveness_check(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.liveness {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting => {
            info!("Liveness check: starting");
            StatusCode::OK // Allow pod to start
        }
        HealthStatus::Unhealthy => {
            error!("Liveness check: unhealthy");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn readiness_check(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.readiness {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => {
            error!("Readiness check: not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn startup_check(State(health_state): State<SharedHealthState>) -> StatusCode {
    let state = health_state.read().await;

    match state.liveness {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => {
            info!("Startup check: not started yet");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn status_report(State(health_state): State<SharedHealthState>) -> Json<StatusReport> {
    let state = health_state.read().await;

    Json(StatusReport {
        liveness: state.liveness,
        readiness: state.readiness,
        messages_relayed: state.messages_relayed,
        messages_passed_through: state.messages_passed_through,
        tombstones_forwarded: state.tombstones_forwarded,
        last_message_age_ms: state
            .last_message_processed
            .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
    })
}

pub fn health_router(health_state: SharedHealthState) -> Router {
    Router::new()
        .route("/healthz", get(liveness_check))
        .route("/ready", get(readiness_check))
        .route("/startup", get(startup_check))
        .route("/status", get(status_report))
        .with_state(health_state)
}

/// Serve the health endpoints on `0.0.0.0:{port}` until the server fails.
///
/// # Errors
/// Returns an error if the port cannot be bound or the server stops with an I/O error.
pub async fn run_health_server(port: u16, health_state: SharedHealthState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server on {addr}"))?;

    info!(event = "health_server_listening", %addr, "Health check server listening");

    axum::serve(listener, health_router(health_state))
        .await
        .context("Health server error")?;

    Ok(())
}
