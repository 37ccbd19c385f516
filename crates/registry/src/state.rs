use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use adsidebar_core_types::PageViewId;

use crate::{errors::RegistryError, metrics};

/// Per page view state keyed by [`PageViewId`].
///
/// Each entry sits behind its own lock so independent page views never contend.
pub struct SessionRegistry<S> {
    sessions: DashMap<PageViewId, Arc<Mutex<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, id: PageViewId, state: S) -> Result<Arc<Mutex<S>>, RegistryError> {
        let entry = Arc::new(Mutex::new(state));
        match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::AlreadyRegistered(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }
        metrics::record_session_opened();
        metrics::set_session_count(self.sessions.len());
        debug!(page_view = %id, "session registered");
        Ok(entry)
    }

    pub fn get(&self, id: &PageViewId) -> Option<Arc<Mutex<S>>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removing an unknown id is a no-op.
    pub fn remove(&self, id: &PageViewId) -> Option<Arc<Mutex<S>>> {
        let removed = self.sessions.remove(id).map(|(_, state)| state);
        if removed.is_some() {
            metrics::record_session_closed();
            metrics::set_session_count(self.sessions.len());
            debug!(page_view = %id, "session removed");
        }
        removed
    }

    pub fn ids(&self) -> Vec<PageViewId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_resolves_sessions() {
        let registry = SessionRegistry::new();
        let id = PageViewId::new();

        let entry = registry.register(id.clone(), 7u32).unwrap();
        *entry.lock() += 1;

        let resolved = registry.get(&id).unwrap();
        assert_eq!(*resolved.lock(), 8);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![id]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = SessionRegistry::new();
        let id = PageViewId::new();
        registry.register(id.clone(), ()).unwrap();

        let err = registry.register(id.clone(), ()).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered(id));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = PageViewId::new();
        registry.register(id.clone(), "page").unwrap();

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn metrics_register_once() {
        let prom = prometheus::Registry::new();
        metrics::register_metrics(&prom);
        metrics::register_metrics(&prom);
        assert!(!prom.gather().is_empty());
    }
}
