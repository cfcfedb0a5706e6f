//! Prometheus metrics for the MQTT proxy.
//!
//! All metrics follow the naming convention: `mqtt_proxy_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., sessions_opened_total)
//! - **Gauge**: Value that can go up or down (e.g., sessions_active)
//! - **Histogram**: Distribution of values (e.g., auth_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

/// Direction label for frames leaving the client.
pub const DIRECTION_CLIENT_TO_BROKER: &str = "client_to_broker";

/// Direction label for frames leaving the broker.
pub const DIRECTION_BROKER_TO_CLIENT: &str = "broker_to_client";

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // SESSION METRICS
    // =========================================================================

    /// Sessions started after a successful broker dial
    pub static ref SESSIONS_OPENED: Counter = Counter::new(
        "mqtt_proxy_sessions_opened_total",
        "Total number of proxied client sessions started"
    ).expect("metric creation failed");

    /// Sessions torn down
    pub static ref SESSIONS_CLOSED: Counter = Counter::new(
        "mqtt_proxy_sessions_closed_total",
        "Total number of proxied client sessions torn down"
    ).expect("metric creation failed");

    /// Currently running sessions
    pub static ref SESSIONS_ACTIVE: Gauge = Gauge::new(
        "mqtt_proxy_sessions_active",
        "Number of currently running client sessions"
    ).expect("metric creation failed");

    /// Broker dials that failed or timed out
    pub static ref BROKER_DIAL_FAILURES: Counter = Counter::new(
        "mqtt_proxy_broker_dial_failures_total",
        "Total number of failed backend broker dials"
    ).expect("metric creation failed");

    /// Frames relayed, by direction
    pub static ref FRAMES_FORWARDED: CounterVec = CounterVec::new(
        Opts::new("mqtt_proxy_frames_forwarded_total", "Frames relayed between client and broker"),
        &["direction"]  // client_to_broker / broker_to_client
    ).expect("metric creation failed");

    // =========================================================================
    // AUTHORIZATION METRICS
    // =========================================================================

    /// Refused requests, by packet kind
    pub static ref AUTH_DENIALS: CounterVec = CounterVec::new(
        Opts::new("mqtt_proxy_auth_denials_total", "Requests refused by the identity service"),
        &["packet"]  // connect / subscribe / publish
    ).expect("metric creation failed");

    /// Identity service round-trip time
    pub static ref AUTH_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "mqtt_proxy_auth_duration_seconds",
            "Time spent waiting for identity and access decisions"
        ).buckets(exponential_buckets(0.0005, 2.0, 13).expect("bucket creation failed"))
    ).expect("metric creation failed");

    // =========================================================================
    // BRIDGE METRICS
    // =========================================================================

    /// Messages mirrored to the bus
    pub static ref BRIDGE_PUBLISHES: Counter = Counter::new(
        "mqtt_proxy_bridge_publishes_total",
        "Total messages mirrored to the internal bus"
    ).expect("metric creation failed");

    /// Bus publishes that failed
    pub static ref BRIDGE_PUBLISH_FAILURES: Counter = Counter::new(
        "mqtt_proxy_bridge_publish_failures_total",
        "Total bus publishes that failed"
    ).expect("metric creation failed");

    /// Bus messages written to clients
    pub static ref BRIDGE_DELIVERIES: Counter = Counter::new(
        "mqtt_proxy_bridge_deliveries_total",
        "Total bus messages delivered to clients"
    ).expect("metric creation failed");

    /// Bus messages skipped because this proxy produced them
    pub static ref ECHOES_SUPPRESSED: Counter = Counter::new(
        "mqtt_proxy_echoes_suppressed_total",
        "Total bus messages skipped by echo suppression"
    ).expect("metric creation failed");

    /// Bus messages discarded by full delivery queues
    pub static ref DELIVERY_DROPS: Counter = Counter::new(
        "mqtt_proxy_delivery_drops_total",
        "Total bus messages dropped because a client fell behind"
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Sessions
        Box::new(SESSIONS_OPENED.clone()),
        Box::new(SESSIONS_CLOSED.clone()),
        Box::new(SESSIONS_ACTIVE.clone()),
        Box::new(BROKER_DIAL_FAILURES.clone()),
        Box::new(FRAMES_FORWARDED.clone()),
        // Authorization
        Box::new(AUTH_DENIALS.clone()),
        Box::new(AUTH_DURATION.clone()),
        // Bridge
        Box::new(BRIDGE_PUBLISHES.clone()),
        Box::new(BRIDGE_PUBLISH_FAILURES.clone()),
        Box::new(BRIDGE_DELIVERIES.clone()),
        Box::new(ECHOES_SUPPRESSED.clone()),
        Box::new(DELIVERY_DROPS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
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

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_encoded_output_names_metrics() {
        register_metrics().unwrap();
        SESSIONS_OPENED.inc();
        FRAMES_FORWARDED
            .with_label_values(&[DIRECTION_CLIENT_TO_BROKER])
            .inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("mqtt_proxy_sessions_opened_total"));
        assert!(text.contains("direction=\"client_to_broker\""));
    }

    #[test]
    fn test_histogram_timer() {
        let before = AUTH_DURATION.get_sample_count();
        drop(HistogramTimer::new(&AUTH_DURATION));
        assert!(AUTH_DURATION.get_sample_count() > before);
    }
}
