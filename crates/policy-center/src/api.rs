use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::warn;

use crate::errors::PolicyError;
use crate::model::{PolicySnapshot, PolicySource, RuntimeOverrideSpec, SiteRule};
use crate::override_store::RuntimeOverrideStore;

#[async_trait]
pub trait PolicyCenter: Send + Sync {
    async fn snapshot(&self) -> Arc<PolicySnapshot>;
    async fn apply_override(&self, override_spec: RuntimeOverrideSpec) -> Result<(), PolicyError>;
    fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>>;
    async fn guard(&self) -> PolicyGuard;
}

struct PolicyState {
    base: PolicySnapshot,
    snapshot: PolicySnapshot,
    overrides: RuntimeOverrideStore,
    rev_counter: u64,
}

impl PolicyState {
    fn new(base: PolicySnapshot) -> Self {
        let rev_counter = base.rev;
        Self {
            base: base.clone(),
            snapshot: base,
            overrides: RuntimeOverrideStore::default(),
            rev_counter,
        }
    }

    fn apply_active_overrides(&mut self) -> Result<(), PolicyError> {
        let mut new_snapshot = self.base.clone();
        let entries = self.overrides.active_entries();
        for (path, value) in entries {
            apply_override_to_snapshot(
                &mut new_snapshot,
                &path,
                &value,
                PolicySource::RuntimeOverride,
            )?;
        }
        new_snapshot.validate()?;
        self.rev_counter = self.rev_counter.saturating_add(1);
        new_snapshot.rev = self.rev_counter;
        self.snapshot = new_snapshot;
        Ok(())
    }
}

/// Holds the live configuration and fans out every revision to subscribers.
pub struct InMemoryPolicyCenter {
    state: Arc<Mutex<PolicyState>>,
    watch_tx: watch::Sender<Arc<PolicySnapshot>>,
}

impl InMemoryPolicyCenter {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let state = PolicyState::new(snapshot);
        let current_snapshot = Arc::new(state.snapshot.clone());
        let (watch_tx, _watch_rx) = watch::channel(current_snapshot);
        Self {
            state: Arc::new(Mutex::new(state)),
            watch_tx,
        }
    }

    /// Latest published snapshot without awaiting the state lock.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.watch_tx.borrow())
    }
}

#[async_trait]
impl PolicyCenter for InMemoryPolicyCenter {
    async fn snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.state.lock().await;
        Arc::new(guard.snapshot.clone())
    }

    async fn apply_override(&self, override_spec: RuntimeOverrideSpec) -> Result<(), PolicyError> {
        let ttl = if override_spec.ttl_seconds > 0 {
            Some(Duration::from_secs(override_spec.ttl_seconds))
        } else {
            None
        };
        let mut guard = self.state.lock().await;
        guard
            .overrides
            .insert(override_spec.path.clone(), override_spec.value.clone(), ttl);
        if let Err(err) = guard.apply_active_overrides() {
            guard.overrides.remove(&override_spec.path);
            return Err(err);
        }
        let snapshot = Arc::new(guard.snapshot.clone());
        drop(guard);

        let _ = self.watch_tx.send(snapshot);

        if let Some(ttl) = ttl {
            let state = Arc::clone(&self.state);
            let watch_tx = self.watch_tx.clone();
            let path = override_spec.path.clone();
            tokio::spawn(async move {
                sleep(ttl).await;
                let mut guard = state.lock().await;
                if guard.overrides.remove(&path) {
                    match guard.apply_active_overrides() {
                        Ok(()) => {
                            let snapshot = Arc::new(guard.snapshot.clone());
                            drop(guard);
                            if watch_tx.send(snapshot).is_err() {
                                warn!("policy override expiry broadcast had no listeners");
                            }
                        }
                        Err(err) => {
                            warn!("policy override expiry recompute failed: {err}");
                        }
                    }
                }
            });
        }

        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.watch_tx.subscribe()
    }

    async fn guard(&self) -> PolicyGuard {
        let snapshot = self.snapshot().await;
        PolicyGuard { snapshot }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyGuard {
    snapshot: Arc<PolicySnapshot>,
}

impl PolicyGuard {
    pub fn revision(&self) -> u64 {
        self.snapshot.rev
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.snapshot)
    }
}

pub(crate) fn apply_override_to_snapshot(
    snapshot: &mut PolicySnapshot,
    path: &str,
    value: &Value,
    source: PolicySource,
) -> Result<(), PolicyError> {
    let changed = match path {
        "general.enabled" => merge_bool(&mut snapshot.general.enabled, to_bool(value)?),
        "general.autohide_seconds" => {
            merge_u64(&mut snapshot.general.autohide_seconds, to_u64(value)?)
        }
        "general.ad_scaling_enabled" => {
            merge_bool(&mut snapshot.general.ad_scaling_enabled, to_bool(value)?)
        }
        "layout.box_width" => merge_u32(&mut snapshot.layout.box_width, to_u32(value)?),
        "layout.box_height" => merge_u32(&mut snapshot.layout.box_height, to_u32(value)?),
        "layout.max_width" => merge_u32(&mut snapshot.layout.max_width, to_u32(value)?),
        "layout.max_height" => merge_u32(&mut snapshot.layout.max_height, to_u32(value)?),
        "layout.visible_boxes" => merge_u32(&mut snapshot.layout.visible_boxes, to_u32(value)?),
        "layout.scale_factor" => {
            merge_f64(&mut snapshot.layout.scale_factor, to_ratio(value)?)
        }
        "convergence.poll_interval_ms" => {
            merge_u64(&mut snapshot.convergence.poll_interval_ms, to_u64(value)?)
        }
        "convergence.max_rounds" => merge_budget(
            &mut snapshot.convergence.max_rounds,
            to_u32(value)?,
            source,
        ),
        "convergence.empty_refresh_ratio" => merge_f64(
            &mut snapshot.convergence.empty_refresh_ratio,
            to_ratio(value)?,
        ),
        "convergence.min_visible_px" => {
            merge_f64(&mut snapshot.convergence.min_visible_px, to_f64(value)?)
        }
        "site_defaults.refresh_third_party_ads" => merge_bool(
            &mut snapshot.site_defaults.refresh_third_party_ads,
            to_bool(value)?,
        ),
        "site_defaults.replay_inline_scripts_on_error" => merge_bool(
            &mut snapshot.site_defaults.replay_inline_scripts_on_error,
            to_bool(value)?,
        ),
        "site_defaults.override_page_ready_hook" => merge_bool(
            &mut snapshot.site_defaults.override_page_ready_hook,
            to_bool(value)?,
        ),
        "sites" => {
            let rules: Vec<SiteRule> = serde_json::from_value(value.clone())
                .map_err(|err| PolicyError::InvalidValue(format!("sites: {err}")))?;
            let changed = snapshot.sites != rules;
            snapshot.sites = rules;
            changed
        }
        path => return Err(PolicyError::UnsupportedPath(path.to_string())),
    };
    if changed {
        snapshot.set_provenance(path, source);
    }
    Ok(())
}

/// Round budgets may only be tightened by files and the environment.
fn merge_budget(target: &mut u32, candidate: u32, source: PolicySource) -> bool {
    let original = *target;
    if matches!(source, PolicySource::RuntimeOverride | PolicySource::Cli) {
        *target = candidate;
    } else {
        *target = (*target).min(candidate);
    }
    *target != original
}

fn merge_u32(target: &mut u32, candidate: u32) -> bool {
    let original = *target;
    *target = candidate;
    *target != original
}

fn merge_u64(target: &mut u64, candidate: u64) -> bool {
    let original = *target;
    *target = candidate;
    *target != original
}

fn merge_f64(target: &mut f64, candidate: f64) -> bool {
    let original = *target;
    *target = candidate;
    (*target - original).abs() > f64::EPSILON
}

fn merge_bool(target: &mut bool, candidate: bool) -> bool {
    let original = *target;
    *target = candidate;
    *target != original
}

fn to_u64(value: &Value) -> Result<u64, PolicyError> {
    value
        .as_u64()
        .ok_or_else(|| PolicyError::InvalidValue(format!("expected integer, got {value}")))
}

fn to_u32(value: &Value) -> Result<u32, PolicyError> {
    to_u64(value).and_then(|v| {
        u32::try_from(v).map_err(|_| PolicyError::InvalidValue(format!("value {v} exceeds u32")))
    })
}

fn to_f64(value: &Value) -> Result<f64, PolicyError> {
    value
        .as_f64()
        .ok_or_else(|| PolicyError::InvalidValue(format!("expected number, got {value}")))
}

fn to_ratio(value: &Value) -> Result<f64, PolicyError> {
    let ratio = to_f64(value)?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(PolicyError::InvalidValue(format!(
            "expected ratio in [0, 1], got {ratio}"
        )));
    }
    Ok(ratio)
}

fn to_bool(value: &Value) -> Result<bool, PolicyError> {
    value
        .as_bool()
        .ok_or_else(|| PolicyError::InvalidValue(format!("expected bool, got {value}")))
}
