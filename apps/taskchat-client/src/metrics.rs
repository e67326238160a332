use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONNECT_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "taskchat_reconnect_attempts_total",
        "Reconnect attempts scheduled",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BACKING_STORE_REACHABLE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "taskchat_backing_store_reachable",
        "Server backing store reachability: 1=up, 0=down",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("taskchat_queue_depth", "Actions waiting in the outbound queue").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static QUEUE_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "taskchat_queue_dropped_total",
            "Queued actions dropped after exhausting retries",
        ),
        &["action_type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIONS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("taskchat_actions_delivered_total", "Actions handed to the server"),
        &["action_type", "route"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
