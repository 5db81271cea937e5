//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention: `bus_<metric>_<unit>`, labelled
//! by topic where it makes sense.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages handed to the broker by a publisher
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("bus_messages_published_total", "Messages written to the broker"),
        &["topic", "delayed"]  // delayed: true/false
    ).expect("metric creation failed");

    /// Publish attempts that returned an error to the caller
    pub static ref PUBLISH_ERRORS: CounterVec = CounterVec::new(
        Opts::new("bus_publish_errors_total", "Publish calls that failed"),
        &["topic", "error_type"]
    ).expect("metric creation failed");

    /// Messages delivered to a topic worker
    pub static ref MESSAGES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("bus_messages_received_total", "Messages delivered to handlers"),
        &["topic"]
    ).expect("metric creation failed");

    /// Deliveries whose body failed to decode
    pub static ref DECODE_FAILURES: CounterVec = CounterVec::new(
        Opts::new("bus_decode_failures_total", "Deliveries that failed payload decoding"),
        &["topic"]
    ).expect("metric creation failed");

    /// Handler invocations that panicked
    pub static ref HANDLER_PANICS: CounterVec = CounterVec::new(
        Opts::new("bus_handler_panics_total", "Handler invocations that panicked"),
        &["topic"]
    ).expect("metric creation failed");

    /// Topic workers currently running
    pub static ref ACTIVE_WORKERS: IntGauge = IntGauge::new(
        "bus_active_workers",
        "Number of topic delivery loops currently running"
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(PUBLISH_ERRORS.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(DECODE_FAILURES.clone()),
        Box::new(HANDLER_PANICS.clone()),
        Box::new(ACTIVE_WORKERS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
