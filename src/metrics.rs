use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::channel::ConnectionState;

/// Metric name prefix for all notification sync metrics
const PREFIX: &str = "igabay_notifications";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Push channel
    pub static ref PUSH_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_push_events_total"), "Push events received"),
        &["event_type"]
    ).expect("Failed to create push_events_total metric");

    pub static ref CHANNEL_RECONNECT_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_channel_reconnect_attempts_total"),
            "Failed channel connects that scheduled a retry"
        ),
        &["reason"]
    ).expect("Failed to create channel_reconnect_attempts_total metric");

    pub static ref CHANNEL_STATE: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_channel_state"), "Channels currently in each state"),
        &["state"]
    ).expect("Failed to create channel_state metric");

    // Poll fallback
    pub static ref POLL_FETCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_poll_fetches_total"), "Poll fetches by outcome"),
        &["status"]
    ).expect("Failed to create poll_fetches_total metric");

    // Local mutations
    pub static ref MUTATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_mutations_total"), "Local mutations by kind and outcome"),
        &["kind", "status"]
    ).expect("Failed to create mutations_total metric");

    pub static ref ACTIVE_SUBSCRIPTIONS: Gauge = Gauge::new(
        format!("{PREFIX}_active_subscriptions"),
        "Number of live subscriber sessions"
    ).expect("Failed to create active_subscriptions metric");
}

/// Register all metrics with the registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(PUSH_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHANNEL_RECONNECT_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHANNEL_STATE.clone()));
    let _ = REGISTRY.register(Box::new(POLL_FETCHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MUTATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_SUBSCRIPTIONS.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_push_event(event_type: &str) {
    PUSH_EVENTS_TOTAL.with_label_values(&[event_type]).inc();
}

pub fn record_reconnect_attempt(reason: &str) {
    CHANNEL_RECONNECT_ATTEMPTS_TOTAL
        .with_label_values(&[reason])
        .inc();
}

/// Move one channel from `from` to `to` in the state gauge
pub fn record_state_transition(from: ConnectionState, to: ConnectionState) {
    if from == to {
        return;
    }
    if from != ConnectionState::Disconnected {
        CHANNEL_STATE.with_label_values(&[from.as_str()]).dec();
    }
    if to != ConnectionState::Disconnected {
        CHANNEL_STATE.with_label_values(&[to.as_str()]).inc();
    }
}

pub fn record_poll_fetch(success: bool) {
    let status = if success { "success" } else { "failure" };
    POLL_FETCHES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_mutation(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    MUTATIONS_TOTAL.with_label_values(&[kind, status]).inc();
}

pub fn session_started() {
    ACTIVE_SUBSCRIPTIONS.inc();
}

pub fn session_stopped() {
    ACTIVE_SUBSCRIPTIONS.dec();
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
