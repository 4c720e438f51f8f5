//! Prometheus metrics for the monitors.
//!
//! Every metric is labelled with the entity kind so one registry can serve
//! all monitors sharing a process.

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;


lazy_static! {
    pub static ref WATCH_FIRINGS: IntCounterVec = IntCounterVec::new(
        Opts::new("monitor_watch_firings", "Watch firings received"),
        &["entity_kind", "watch"]
    )
    .expect("metric can not be created");

    pub static ref DEVICE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("monitor_device_events", "Events delivered to subscribers"),
        &["entity_kind", "event"]
    )
    .expect("metric can not be created");

    pub static ref DEDUP_SUPPRESSED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "monitor_dedup_suppressed",
            "Snapshots dropped because they equal the last delivered one"
        ),
        &["entity_kind"]
    )
    .expect("metric can not be created");

    pub static ref SESSION_RESYNCS: IntCounterVec = IntCounterVec::new(
        Opts::new("monitor_session_resyncs", "Full resyncs after session expiry"),
        &["entity_kind"]
    )
    .expect("metric can not be created");

    pub static ref TRACKED_ENTITIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("monitor_tracked_entities", "Entities with live bookkeeping"),
        &["entity_kind"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        register_custom_metrics(&registry);
        registry
    };
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(WATCH_FIRINGS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(DEVICE_EVENTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(DEDUP_SUPPRESSED.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SESSION_RESYNCS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(TRACKED_ENTITIES.clone()))
        .expect("collector can be registered");
}

/// Renders the monitor registry in the Prometheus text format
pub fn gather() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode monitor metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
