//! Prometheus exposition over HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

/// Serve `GET /metrics` for the given registry until shutdown.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, mut shutdown: watch::Receiver<bool>) {
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(err) = result {
        // The process keeps capturing; only the metrics surface is gone.
        error!(error = %err, "http metrics endpoint failed");
    }
}

async fn render(State(registry): State<Arc<Registry>>) -> ([(axum::http::HeaderName, &'static str); 1], Vec<u8>) {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buf) {
        error!(error = %err, "encoding metrics");
    }
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], buf)
}

/// A JSON snapshot of every counter and gauge in the registry, used for
/// the optional MQTT telemetry topic.
pub fn snapshot(registry: &Registry) -> serde_json::Value {
    let mut counters = serde_json::Map::new();
    for family in registry.gather() {
        let total: f64 = family
            .get_metric()
            .iter()
            .map(|m| {
                if m.has_counter() {
                    m.get_counter().get_value()
                } else if m.has_gauge() {
                    m.get_gauge().get_value()
                } else {
                    0.0
                }
            })
            .sum();
        counters.insert(family.get_name().to_string(), serde_json::json!(total));
    }
    serde_json::json!({
        "time": chrono::Utc::now(),
        "counters": counters,
    })
}
