//! Entry point for hosts. Owns the session registry and routes every host
//! callback to the page view it belongs to.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use adsidebar_core_types::{FeedId, NodeId, PageViewId, PolicyDecision, TimerId, Verdict};
use adsidebar_event_bus::InMemoryBus;
use adsidebar_policy_center::InMemoryPolicyCenter;
use adsidebar_registry::SessionRegistry;

use crate::errors::EngineError;
use crate::events::SidebarEvent;
use crate::host::{DomHost, SettleOutcome};
use crate::metrics;
use crate::model::SessionStats;
use crate::monitor;
use crate::observer;
use crate::phase;
use crate::replay;
use crate::session::PageSession;
use crate::sidebar;

const EVENT_BUS_CAPACITY: usize = 256;

pub struct AdSidebar {
    policy: Arc<InMemoryPolicyCenter>,
    sessions: SessionRegistry<PageSession>,
    bus: Arc<InMemoryBus<SidebarEvent>>,
}

impl AdSidebar {
    pub fn new(policy: Arc<InMemoryPolicyCenter>) -> Self {
        Self::with_bus(policy, InMemoryBus::new(EVENT_BUS_CAPACITY))
    }

    pub fn with_bus(policy: Arc<InMemoryPolicyCenter>, bus: Arc<InMemoryBus<SidebarEvent>>) -> Self {
        metrics::register_metrics();
        Self {
            policy,
            sessions: SessionRegistry::new(),
            bus,
        }
    }

    pub fn bus(&self) -> Arc<InMemoryBus<SidebarEvent>> {
        Arc::clone(&self.bus)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidebarEvent> {
        self.bus.subscribe()
    }

    pub fn policy(&self) -> Arc<InMemoryPolicyCenter> {
        Arc::clone(&self.policy)
    }

    /// Starts a session for a new page view. Frames other than the top-level
    /// document get none.
    pub fn open_page(
        &self,
        location: &str,
        top_level: bool,
    ) -> Result<Option<PageViewId>, EngineError> {
        if !top_level {
            trace!(target: "adsidebar.phase", location, "sub-frame ignored");
            return Ok(None);
        }
        let snapshot = self.policy.current();
        let id = PageViewId::new();
        let session = PageSession::new(id.clone(), location, snapshot);
        self.sessions.register(id.clone(), session)?;
        info!(target: "adsidebar.phase", page_view = %id, location, "page view opened");
        Ok(Some(id))
    }

    pub fn active_pages(&self) -> Vec<PageViewId> {
        self.sessions.ids()
    }

    /// Runs `handler` under the session lock, then publishes what it emitted.
    fn with_session<R>(
        &self,
        page: &PageViewId,
        handler: impl FnOnce(&mut PageSession) -> R,
    ) -> Option<R> {
        let Some(entry) = self.sessions.get(page) else {
            trace!(target: "adsidebar.phase", page_view = %page, "callback for unknown page view");
            return None;
        };
        let (result, events) = {
            let mut session = entry.lock();
            if session.is_closed() {
                return None;
            }
            let result = handler(&mut session);
            (result, session.take_events())
        };
        for event in events {
            self.bus.emit(event);
        }
        Some(result)
    }

    pub fn on_policy_decision(
        &self,
        page: &PageViewId,
        host: &mut dyn DomHost,
        element: NodeId,
        decision: &PolicyDecision,
    ) -> Verdict {
        let external = if decision.blocked {
            Verdict::Block
        } else {
            Verdict::Allow
        };
        if !self.policy.current().general.enabled {
            return external;
        }
        if !decision.blocked {
            return Verdict::Allow;
        }
        self.with_session(page, |session| {
            phase::policy_decision(session, host, element, decision)
        })
        .unwrap_or(Verdict::Block)
    }

    pub fn on_window_load(&self, page: &PageViewId, host: &mut dyn DomHost) {
        self.with_session(page, |session| phase::window_loaded(session, host));
    }

    pub fn on_element_settled(
        &self,
        page: &PageViewId,
        host: &mut dyn DomHost,
        node: NodeId,
        outcome: SettleOutcome,
    ) {
        self.with_session(page, |session| {
            replay::on_settled(session, host, node, outcome)
        });
    }

    pub fn on_timer(&self, page: &PageViewId, host: &mut dyn DomHost, timer: TimerId) {
        self.with_session(page, |session| {
            if !monitor::on_timer(session, host, timer)
                && !sidebar::on_autohide_timer(session, host, timer)
            {
                trace!(target: "adsidebar.monitor", page_view = %session.id, ?timer, "stale timer ignored");
            }
        });
    }

    pub fn on_mutations(&self, page: &PageViewId, host: &mut dyn DomHost, feed: FeedId) {
        self.with_session(page, |session| {
            if session.monitor.note_mutations(feed) {
                return;
            }
            if session.observer.feed() == Some(feed) {
                observer::on_batch(session, host);
            }
        });
    }

    pub fn on_document_write(&self, page: &PageViewId, host: &mut dyn DomHost, markup: &str) {
        self.with_session(page, |session| {
            replay::on_document_write(session, host, markup)
        });
    }

    /// Script error reported by the page itself.
    pub fn on_script_error(&self, page: &PageViewId) {
        self.with_session(page, |session| {
            if !session.script_error {
                debug!(target: "adsidebar.phase", page_view = %session.id, "page script error recorded");
            }
            session.script_error = true;
        });
    }

    pub fn on_pointer_enter(&self, page: &PageViewId, host: &mut dyn DomHost) {
        self.with_session(page, |session| sidebar::pointer_enter(session, host));
    }

    pub fn on_pointer_leave(&self, page: &PageViewId, host: &mut dyn DomHost) {
        self.with_session(page, |session| sidebar::pointer_leave(session, host));
    }

    fn chrome(
        &self,
        page: &PageViewId,
        host: &mut dyn DomHost,
        action: fn(&mut PageSession, &mut dyn DomHost) -> bool,
    ) -> Result<(), EngineError> {
        match self.with_session(page, |session| action(session, host)) {
            Some(true) => Ok(()),
            Some(false) => Err(EngineError::SidebarNotReady(page.clone())),
            None => Err(EngineError::UnknownPageView(page.clone())),
        }
    }

    pub fn show(&self, page: &PageViewId, host: &mut dyn DomHost) -> Result<(), EngineError> {
        self.chrome(page, host, sidebar::show)
    }

    pub fn hide(&self, page: &PageViewId, host: &mut dyn DomHost) -> Result<(), EngineError> {
        self.chrome(page, host, sidebar::hide)
    }

    pub fn toggle(&self, page: &PageViewId, host: &mut dyn DomHost) -> Result<(), EngineError> {
        self.chrome(page, host, sidebar::toggle)
    }

    pub fn set_expanded(
        &self,
        page: &PageViewId,
        host: &mut dyn DomHost,
        expanded: bool,
    ) -> Result<(), EngineError> {
        self.with_session(page, |session| {
            sidebar::set_expanded(session, host, expanded)
        })
        .ok_or_else(|| EngineError::UnknownPageView(page.clone()))
    }

    pub fn stats(&self, page: &PageViewId) -> Result<SessionStats, EngineError> {
        self.sessions
            .get(page)
            .map(|entry| entry.lock().stats())
            .ok_or_else(|| EngineError::UnknownPageView(page.clone()))
    }

    /// Releases the page view. Closing twice, or closing an unknown page view,
    /// has no effect.
    pub fn close_page(&self, page: &PageViewId, host: &mut dyn DomHost) {
        let Some(entry) = self.sessions.remove(page) else {
            return;
        };
        let mut session = entry.lock();
        session.teardown(host);
        info!(target: "adsidebar.phase", page_view = %page, phase = %session.phase(), "page view closed");
    }
}
