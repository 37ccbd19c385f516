use lazy_static::lazy_static;
use prometheus::{core::Collector, IntCounter, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref REGISTRY_SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "adsidebar_registry_sessions_active",
        "Page view sessions currently tracked"
    )
    .unwrap();
    static ref REGISTRY_SESSIONS_OPENED: IntCounter = IntCounter::new(
        "adsidebar_registry_sessions_opened_total",
        "Page view sessions registered"
    )
    .unwrap();
    static ref REGISTRY_SESSIONS_CLOSED: IntCounter = IntCounter::new(
        "adsidebar_registry_sessions_closed_total",
        "Page view sessions removed"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register registry metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, REGISTRY_SESSIONS_ACTIVE.clone());
    register(registry, REGISTRY_SESSIONS_OPENED.clone());
    register(registry, REGISTRY_SESSIONS_CLOSED.clone());
}

pub fn set_session_count(count: usize) {
    REGISTRY_SESSIONS_ACTIVE.set(count as i64);
}

pub fn record_session_opened() {
    REGISTRY_SESSIONS_OPENED.inc();
}

pub fn record_session_closed() {
    REGISTRY_SESSIONS_CLOSED.inc();
}
