use std::sync::Arc;

use tracing::{debug, info, warn};

use adsidebar_core_types::{Hit, NodeId, PageViewId, Phase};
use adsidebar_policy_center::{PolicySnapshot, SiteOverrides};

use crate::container::RelocationContainer;
use crate::events::SidebarEvent;
use crate::host::DomHost;
use crate::metrics;
use crate::model::{AdLoadStats, SessionStats};
use crate::monitor::{self, ConvergenceMonitor};
use crate::observer::InsertionObserver;
use crate::replay::ReplayQueue;
use crate::sidebar::SidebarChrome;

/// State of one top-level page view. Owned by the controller through the
/// session registry; every handler receives it by `&mut`.
pub struct PageSession {
    pub(crate) id: PageViewId,
    pub(crate) location: String,
    pub(crate) phase: Phase,
    pub(crate) policy: Arc<PolicySnapshot>,
    pub(crate) site: SiteOverrides,
    pub(crate) hits: Vec<Hit>,
    pub(crate) replay: ReplayQueue,
    pub(crate) container: Option<RelocationContainer>,
    pub(crate) monitor: ConvergenceMonitor,
    pub(crate) observer: InsertionObserver,
    pub(crate) sidebar: SidebarChrome,
    pub(crate) ad_stats: AdLoadStats,
    pub(crate) script_error: bool,
    pub(crate) remediated: bool,
    closed: bool,
    outbox: Vec<SidebarEvent>,
}

impl PageSession {
    pub fn new(id: PageViewId, location: impl Into<String>, policy: Arc<PolicySnapshot>) -> Self {
        let location = location.into();
        let site = policy.site_overrides(&location);
        Self {
            id,
            location,
            phase: Phase::Init,
            policy,
            site,
            hits: Vec::new(),
            replay: ReplayQueue::default(),
            container: None,
            monitor: ConvergenceMonitor::default(),
            observer: InsertionObserver::default(),
            sidebar: SidebarChrome::default(),
            ad_stats: AdLoadStats::default(),
            script_error: false,
            remediated: false,
            closed: false,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> &PageViewId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn site(&self) -> SiteOverrides {
        self.site
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    pub fn container(&self) -> Option<&RelocationContainer> {
        self.container.as_ref()
    }

    pub fn replay(&self) -> &ReplayQueue {
        &self.replay
    }

    pub fn monitor(&self) -> &ConvergenceMonitor {
        &self.monitor
    }

    pub fn sidebar(&self) -> &SidebarChrome {
        &self.sidebar
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Moves the phase forward. Requests to stay or go back are refused.
    pub(crate) fn advance(&mut self, next: Phase) -> bool {
        if next <= self.phase {
            warn!(
                target: "adsidebar.phase",
                page_view = %self.id,
                current = %self.phase,
                requested = %next,
                "refusing non-forward phase transition"
            );
            return false;
        }
        let from = self.phase;
        self.phase = next;
        metrics::record_phase(next.as_str());
        info!(target: "adsidebar.phase", page_view = %self.id, %from, to = %next, "phase changed");
        self.emit(SidebarEvent::PhaseChanged {
            page_view: self.id.clone(),
            from,
            to: next,
        });
        true
    }

    pub(crate) fn emit(&mut self, event: SidebarEvent) {
        self.outbox.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<SidebarEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn add_hits(&mut self, hits: &[Hit]) {
        for hit in hits {
            if !self.hits.contains(hit) {
                self.hits.push(hit.clone());
            }
        }
    }

    /// Moves `node` into the container. Kicks the convergence monitor first so
    /// the relocation is observed as activity.
    pub(crate) fn relocate(&mut self, host: &mut dyn DomHost, node: NodeId) -> Option<NodeId> {
        monitor::kick(self, host);
        let container = self.container.as_mut()?;
        let wrapper = container.insert(host, node);
        metrics::record_relocation();
        debug!(
            target: "adsidebar.observer",
            page_view = %self.id,
            %node,
            wrapper = %wrapper,
            "element relocated"
        );
        Some(wrapper)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            page_view: self.id.clone(),
            location: self.location.clone(),
            phase: self.phase,
            enabled_ad_count: self.ad_stats.confirmed_ad_count,
            displayed: self.sidebar.is_displayed(),
            expanded: self.sidebar.is_expanded(),
            queued_items: self.replay.len(),
            hit_count: self.hits.len(),
            relocated_count: self
                .container
                .as_ref()
                .map(|c| c.relocated_count())
                .unwrap_or(0),
            monitor_rounds: self.monitor.rounds_total(),
            refresh_calls: self.monitor.refresh_calls(),
            script_error: self.script_error,
            remediated: self.remediated,
            ads: self.ad_stats.clone(),
            replay: self.replay.stats().clone(),
        }
    }

    /// Releases every feed, timer, listener and interception the session owns.
    /// Safe to call repeatedly and before anything started.
    pub(crate) fn teardown(&mut self, host: &mut dyn DomHost) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.replay.teardown(host);
        self.monitor.stop(host);
        self.observer.stop(host);
        self.sidebar.cancel_autohide(host);
        debug!(target: "adsidebar.phase", page_view = %self.id, phase = %self.phase, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsidebar_policy_center::default_snapshot;

    #[test]
    fn phase_only_moves_forward() {
        let mut session = PageSession::new(
            PageViewId::new(),
            "https://example.com/",
            Arc::new(default_snapshot()),
        );
        assert!(session.advance(Phase::WindowLoaded));
        assert!(!session.advance(Phase::WindowLoaded));
        assert!(!session.advance(Phase::Init));
        assert_eq!(session.phase(), Phase::WindowLoaded);
        assert_eq!(session.take_events().len(), 1);
    }

    #[test]
    fn duplicate_hits_are_folded() {
        let mut session = PageSession::new(
            PageViewId::new(),
            "https://example.com/",
            Arc::new(default_snapshot()),
        );
        let hit = Hit::elem_hide("##.ad");
        session.add_hits(&[hit.clone(), hit.clone()]);
        session.add_hits(&[hit, Hit::blocking("||ads.example^")]);
        assert_eq!(session.hits().len(), 2);
    }
}
