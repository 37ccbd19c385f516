use adsidebar_registry::metrics as registry_metrics;
use lazy_static::lazy_static;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{core::Collector, opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use tracing::error;

use crate::errors::EngineError;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

lazy_static! {
    static ref RELOCATIONS: IntCounter = IntCounter::new(
        "adsidebar_relocations_total",
        "Elements moved into the relocation container"
    )
    .unwrap();
    static ref REPLAYED_ITEMS: IntCounter = IntCounter::new(
        "adsidebar_replayed_items_total",
        "Queued items replayed after page load"
    )
    .unwrap();
    static ref DEAD_ITEMS: IntCounter = IntCounter::new(
        "adsidebar_dead_items_total",
        "Queued items skipped because their element was gone"
    )
    .unwrap();
    static ref MONITOR_ROUNDS: IntCounter = IntCounter::new(
        "adsidebar_monitor_rounds_total",
        "Convergence monitor sampling rounds"
    )
    .unwrap();
    static ref AD_REFRESHES: IntCounter = IntCounter::new(
        "adsidebar_ad_refresh_total",
        "Third-party ad refresh calls"
    )
    .unwrap();
    static ref FORCED_ACCEPTANCES: IntCounter = IntCounter::new(
        "adsidebar_forced_acceptances_total",
        "Convergence declared after the round budget ran out"
    )
    .unwrap();
    static ref PHASE_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        opts!(
            "adsidebar_phase_transitions_total",
            "Page view phase transitions grouped by target phase"
        ),
        &["phase"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register engine metric");
        }
    }
}

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        registry_metrics::register_metrics(registry);
        register(registry, RELOCATIONS.clone());
        register(registry, REPLAYED_ITEMS.clone());
        register(registry, DEAD_ITEMS.clone());
        register(registry, MONITOR_ROUNDS.clone());
        register(registry, AD_REFRESHES.clone());
        register(registry, FORCED_ACCEPTANCES.clone());
        register(registry, PHASE_TRANSITIONS.clone());
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

/// Prometheus text exposition of everything registered so far.
pub fn render_text() -> Result<String, EngineError> {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&global_registry().gather(), &mut buffer)
        .map_err(|err| EngineError::Metrics(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| EngineError::Metrics(err.to_string()))
}

pub fn record_relocation() {
    RELOCATIONS.inc();
}

pub fn record_replayed() {
    REPLAYED_ITEMS.inc();
}

pub fn record_dead_item() {
    DEAD_ITEMS.inc();
}

pub fn record_round() {
    MONITOR_ROUNDS.inc();
}

pub fn record_refresh() {
    AD_REFRESHES.inc();
}

pub fn record_forced_acceptance() {
    FORCED_ACCEPTANCES.inc();
}

pub fn record_phase(phase: &str) {
    PHASE_TRANSITIONS.with_label_values(&[phase]).inc();
}
