// observability/metrics.rs - Prometheus Metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for metrics
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address to expose the metrics endpoint
    pub listen_addr: SocketAddr,

    /// Histogram buckets for routing and registration latency (seconds)
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0,
            ],
        }
    }
}

/// Handle to the Prometheus metrics exporter
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Envelope routing metrics
pub struct RouteMetrics;

impl RouteMetrics {
    pub const TOTAL: &'static str = "acn_routes_total";
    pub const LATENCY_SECONDS: &'static str = "acn_route_latency_seconds";
    pub const DHT_LOOKUP_SECONDS: &'static str = "acn_dht_lookup_latency_seconds";
}

/// Client-facing service metrics
pub struct ServiceMetrics;

impl ServiceMetrics {
    pub const DELEGATE_CLIENTS: &'static str = "acn_delegate_clients";
    pub const RELAY_CLIENTS: &'static str = "acn_relay_clients";
    pub const REGISTRATIONS_TOTAL: &'static str = "acn_registrations_total";
    pub const REGISTRATION_SECONDS: &'static str = "acn_registration_latency_seconds";
}

/// Initialize the metrics system
///
/// Installs the global recorder and serves `/metrics`, `/health`, `/ready`
/// and `/live` on the configured address.
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsHandle, Box<dyn std::error::Error>> {
    let mut builder = PrometheusBuilder::new();
    for name in [
        RouteMetrics::LATENCY_SECONDS,
        RouteMetrics::DHT_LOOKUP_SECONDS,
        ServiceMetrics::REGISTRATION_SECONDS,
    ] {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.into()), &config.latency_buckets)?;
    }

    let handle = builder.install_recorder()?;
    let metrics_handle = MetricsHandle { handle: handle.clone() };

    let listen_addr = config.listen_addr;
    let shared_handle = std::sync::Arc::new(handle);

    tokio::spawn(async move {
        use axum::{Json, Router, http::StatusCode, routing::get};

        #[derive(Serialize)]
        struct HealthResponse {
            status: &'static str,
            version: &'static str,
            uptime_secs: u64,
        }

        let start_time = std::time::Instant::now();

        let handle_for_route = shared_handle.clone();
        let app = Router::new()
            .route("/metrics", get(move || {
                let h = handle_for_route.clone();
                async move { h.render() }
            }))
            .route("/health", get(move || {
                let uptime = start_time.elapsed().as_secs();
                async move {
                    Json(HealthResponse {
                        status: "healthy",
                        version: env!("CARGO_PKG_VERSION"),
                        uptime_secs: uptime,
                    })
                }
            }))
            .route("/ready", get(|| async { StatusCode::OK }))
            .route("/live", get(|| async { StatusCode::OK }));

        match tokio::net::TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %listen_addr, "Metrics HTTP server started");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, addr = %listen_addr, "Failed to bind metrics server");
            }
        }
    });

    describe_counter!(RouteMetrics::TOTAL, "Envelopes routed, by result status");
    describe_histogram!(RouteMetrics::LATENCY_SECONDS, "Envelope routing latency in seconds");
    describe_histogram!(
        RouteMetrics::DHT_LOOKUP_SECONDS,
        "DHT provider lookup latency in seconds"
    );

    describe_gauge!(ServiceMetrics::DELEGATE_CLIENTS, "Connected delegate clients");
    describe_gauge!(ServiceMetrics::RELAY_CLIENTS, "Connected relay clients");
    describe_counter!(
        ServiceMetrics::REGISTRATIONS_TOTAL,
        "Registration attempts, by result status"
    );
    describe_histogram!(
        ServiceMetrics::REGISTRATION_SECONDS,
        "Registration handshake latency in seconds"
    );

    tracing::info!(addr = %config.listen_addr, "Metrics initialized");

    Ok(metrics_handle)
}

/// Record the outcome of routing one envelope
pub fn record_route(status: &str, latency: Duration) {
    counter!(RouteMetrics::TOTAL, "status" => status.to_string()).increment(1);
    histogram!(RouteMetrics::LATENCY_SECONDS).record(latency.as_secs_f64());
}

pub fn record_dht_lookup(latency: Duration, found: bool) {
    histogram!(RouteMetrics::DHT_LOOKUP_SECONDS, "found" => found.to_string())
        .record(latency.as_secs_f64());
}

/// Record a registration handshake
pub fn record_registration(service: &str, status: &str, latency: Duration) {
    counter!(
        ServiceMetrics::REGISTRATIONS_TOTAL,
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(ServiceMetrics::REGISTRATION_SECONDS, "service" => service.to_string())
        .record(latency.as_secs_f64());
}

/// Adjust the connected client gauge for a front-end service
pub fn record_client_connected(service: &str, delta: f64) {
    let name = match service {
        "relay" => ServiceMetrics::RELAY_CLIENTS,
        _ => ServiceMetrics::DELEGATE_CLIENTS,
    };
    gauge!(name).increment(delta);
}
