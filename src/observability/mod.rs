// observability/mod.rs - Tracing and Metrics

//! Structured logging and Prometheus metrics for ACN nodes.
//!
//! ```ignore
//! use acn::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig};
//!
//! init_tracing(&TracingConfig::default())?;
//! let handle = init_metrics(MetricsConfig::default())?;
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    MetricsConfig, MetricsHandle, RouteMetrics, ServiceMetrics, init_metrics,
    record_client_connected, record_dht_lookup, record_registration, record_route,
};

pub use tracing_setup::{TracingConfig, TracingFormat, init_tracing};
