//! Prometheus-format admission counters, exposed over HTTP at `/metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::info;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CountryLabel {
    country: String,
}

/// The two admission counter vectors, labeled by country.
pub struct Metrics {
    allowed: Family<CountryLabel, Counter>,
    rejected: Family<CountryLabel, Counter>,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Metrics {
        let mut registry = Registry::default();
        let allowed = Family::<CountryLabel, Counter>::default();
        let rejected = Family::<CountryLabel, Counter>::default();

        registry.register("geoblock_allowed", "Total of allowed flows", allowed.clone());
        registry.register("geoblock_rejected", "Total of rejected flows", rejected.clone());

        Metrics { allowed, rejected, registry }
    }

    pub fn record_allowed(&self, country: &str) {
        self.allowed
            .get_or_create(&CountryLabel { country: country.to_string() })
            .inc();
    }

    pub fn record_rejected(&self, country: &str) {
        self.rejected
            .get_or_create(&CountryLabel { country: country.to_string() })
            .inc();
    }

    fn render(&self) -> String {
        let mut buf = String::new();
        // The prometheus-client encoder cannot fail against a String buffer.
        encode(&mut buf, &self.registry).expect("encoding metrics");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let body = metrics.render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        body,
    )
}

/// Serves the `/metrics` endpoint on `addr` until the process exits. Spawned as
/// an independent task alongside the proxies; a failure here does not affect
/// traffic forwarding.
pub async fn serve(addr: std::net::SocketAddr, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting metrics endpoint on {addr}");
    axum::serve(listener, app).await
}
