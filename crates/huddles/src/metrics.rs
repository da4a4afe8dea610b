use crate::registry::Registry;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct RoomStatus {
    status: &'static str,
    participants: usize,
    retained: usize,
}

/// What `/health` and `/ready` report: the room registry plus a draining flag.
#[derive(Clone)]
pub struct HealthState {
    draining: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

impl HealthState {
    /// Health view over `registry`, initially ready.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            registry,
        }
    }

    /// Stop reporting ready; the relay is shutting down.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Whether the relay still accepts participants.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.draining.load(Ordering::Relaxed)
    }

    fn room_status(&self, status: &'static str) -> RoomStatus {
        RoomStatus {
            status,
            participants: self.registry.visible_roster().len(),
            retained: self.registry.len(),
        }
    }
}

/// Serve `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or the listener cannot bind.
pub async fn start_metrics_server(addr: SocketAddr, health: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", {
            let health = health.clone();
            get(move || std::future::ready(Json(health.room_status("healthy"))))
        })
        .route("/ready", get(move || std::future::ready(ready(&health))));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn ready(health: &HealthState) -> (StatusCode, Json<RoomStatus>) {
    if health.is_ready() {
        (StatusCode::OK, Json(health.room_status("ready")))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(health.room_status("draining")),
        )
    }
}

/// Gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("huddle_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("huddle_connections_active").decrement(1.0);
    }

    /// Record the number of registry entries, grace-period ones included.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_registry_size(entries: usize) {
        metrics::gauge!("huddle_registry_entries").set(entries as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a join, labelled `new` or `resumed`.
    pub fn joins_total(kind: &'static str) {
        metrics::counter!("huddle_joins_total", "kind" => kind).increment(1);
    }

    /// Increment the relayed-messages counter for an envelope type.
    pub fn messages_relayed_total(message_type: &'static str) {
        metrics::counter!("huddle_messages_relayed_total", "type" => message_type).increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("huddle_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Count an envelope rejected by validation.
    pub fn protocol_errors_total() {
        metrics::counter!("huddle_protocol_errors_total").increment(1);
    }

    /// Count a participant removed after its grace window.
    pub fn grace_expired_total() {
        metrics::counter!("huddle_grace_expired_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the time spent validating and fanning out one inbound message.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("huddle_relay_latency_seconds").record(value);
    }
}
