use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Runtime overrides keyed by dot-path. Expired entries are dropped lazily.
#[derive(Clone, Debug, Default)]
pub struct RuntimeOverrideStore {
    entries: BTreeMap<String, OverrideEntry>,
}

#[derive(Clone, Debug)]
pub struct OverrideEntry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

impl OverrideEntry {
    fn active_at(&self, now: Instant) -> bool {
        self.expires_at.map(|expires| expires > now).unwrap_or(true)
    }
}

impl RuntimeOverrideStore {
    pub fn insert(&mut self, path: String, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|dur| Instant::now() + dur);
        self.entries.insert(path, OverrideEntry { value, expires_at });
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    /// Active entries in path order; expired ones are evicted on the way.
    pub fn active_entries(&mut self) -> Vec<(String, Value)> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.active_at(now));
        self.entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
