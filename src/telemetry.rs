use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize application telemetry (Logging, Tracing, Metrics).
///
/// Currently configures:
/// - `tracing-subscriber::fmt` for structured logging.
/// - `EnvFilter` for dynamic log levels (RUST_LOG).
pub fn init() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact();

    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,switchboard=debug"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus recorder and register the gateway's counters.
/// Returns `None` when a recorder is already installed (tests).
pub fn install_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    metrics::describe_counter!(
        "gateway_requests_total",
        "Finished chat requests by outcome"
    );
    metrics::describe_counter!(
        "gateway_audit_dropped_total",
        "Audit records dropped on queue overflow"
    );
    metrics::describe_counter!(
        "gateway_breaker_transitions_total",
        "Circuit breaker state transitions by agent and target state"
    );
    metrics::describe_counter!(
        "gateway_agent_respawns_total",
        "Agent subprocess respawn attempts"
    );
    metrics::describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the per-caller rate limit"
    );
    Some(handle)
}
