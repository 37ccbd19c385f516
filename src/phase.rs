//! Phase transitions of a page view and the policy-decision gate.

use tracing::{debug, trace};

use adsidebar_core_types::{NodeId, Phase, PolicyDecision, Verdict};

use crate::container::RelocationContainer;
use crate::events::SidebarEvent;
use crate::host::DomHost;
use crate::monitor;
use crate::observer;
use crate::remediation;
use crate::replay;
use crate::session::PageSession;
use crate::sidebar;

/// Page load signal. Builds the sidebar, moves what the hiding rules already
/// match and starts replaying the queue.
pub(crate) fn window_loaded(session: &mut PageSession, host: &mut dyn DomHost) {
    if session.phase != Phase::Init {
        trace!(target: "adsidebar.phase", page_view = %session.id, phase = %session.phase, "duplicate load signal ignored");
        return;
    }
    session.advance(Phase::WindowLoaded);

    let layout = session.policy.layout.clone();
    let body = host.document_body();
    let sidebar_root = session.sidebar.attach(host, body, &layout);
    session.container = Some(RelocationContainer::create(host, sidebar_root, &layout));

    observer::start(session, host);
    observer::relocate_hidden(session, host);

    if !session.replay.is_empty() {
        session.advance(Phase::ReplayStarted);
    }
    replay::start(session, host);
}

pub(crate) fn replay_exhausted(session: &mut PageSession, host: &mut dyn DomHost) {
    if !session.advance(Phase::ReplayComplete) {
        return;
    }
    remediation::run(session, host);
    session.advance(Phase::AdMonitorStarted);
    monitor::start(session, host);
}

/// Completion of a monitor cycle with `confirmed` visible ads.
pub(crate) fn monitor_settled(
    session: &mut PageSession,
    host: &mut dyn DomHost,
    confirmed: usize,
    previous_last_box: Option<NodeId>,
) {
    if session.phase == Phase::AdMonitorStarted {
        session.advance(Phase::AdMonitorComplete);
    }

    if confirmed > session.ad_stats.confirmed_ad_count {
        session.ad_stats.confirmed_ad_count = confirmed;
        let last_box = session
            .container
            .as_ref()
            .and_then(RelocationContainer::last_visible_box);
        session.emit(SidebarEvent::NewAdsArrived {
            page_view: session.id.clone(),
            confirmed_ads: confirmed,
            last_box,
            previous_last_box,
        });
        sidebar::reveal(session, host);
    } else {
        debug!(
            target: "adsidebar.phase",
            page_view = %session.id,
            confirmed,
            best = session.ad_stats.confirmed_ad_count,
            "no new ads"
        );
    }

    if session.phase == Phase::AdMonitorComplete {
        session.advance(Phase::Done);
    }
}

/// Gate for one blocked candidate element. Before load the element is queued
/// and stays blocked; afterwards it is allowed and relocated.
pub(crate) fn policy_decision(
    session: &mut PageSession,
    host: &mut dyn DomHost,
    element: NodeId,
    decision: &PolicyDecision,
) -> Verdict {
    if session.phase < Phase::WindowLoaded {
        session.add_hits(&decision.hits);
        let item = replay::capture(host, element);
        trace!(
            target: "adsidebar.replay",
            page_view = %session.id,
            %element,
            kind = item.label(),
            "blocked element queued"
        );
        session.replay.enqueue(item);
        return Verdict::Block;
    }
    if session.container.is_none() {
        return Verdict::Block;
    }
    session.add_hits(&decision.hits);
    if session.phase >= Phase::AdMonitorComplete {
        observer::insert_dynamic(session, host, element, &decision.hits);
    }
    Verdict::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDom;
    use adsidebar_core_types::{Hit, PageViewId};
    use adsidebar_policy_center::default_snapshot;
    use std::sync::Arc;

    fn session() -> PageSession {
        PageSession::new(
            PageViewId::new(),
            "https://example.com/",
            Arc::new(default_snapshot()),
        )
    }

    #[test]
    fn blocked_elements_are_queued_before_load() {
        let mut dom = SimDom::from_markup(r#"<div id="ad">x</div>"#);
        let mut session = session();
        let ad = dom.find("#ad").unwrap();
        let decision = PolicyDecision::block(vec![Hit::blocking("||ads.example^")]);

        let verdict = policy_decision(&mut session, &mut dom, ad, &decision);

        assert_eq!(verdict, Verdict::Block);
        assert_eq!(session.replay().len(), 1);
        assert_eq!(session.hits().len(), 1);
    }

    #[test]
    fn empty_queue_goes_straight_to_monitoring() {
        let mut dom = SimDom::from_markup("<p>article</p>");
        let mut session = session();

        window_loaded(&mut session, &mut dom);

        assert_eq!(session.phase(), Phase::AdMonitorStarted);
        assert!(session.monitor().is_polling());
        assert!(session.sidebar().root().is_some());

        let phases: Vec<Phase> = session
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SidebarEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::WindowLoaded,
                Phase::ReplayComplete,
                Phase::AdMonitorStarted
            ]
        );
    }

    #[test]
    fn blocked_elements_are_allowed_once_the_container_exists() {
        let mut dom = SimDom::from_markup(r#"<div id="late">x</div>"#);
        let mut session = session();
        window_loaded(&mut session, &mut dom);
        let late = dom.find("#late").unwrap();

        let verdict = policy_decision(
            &mut session,
            &mut dom,
            late,
            &PolicyDecision::block(vec![Hit::blocking("||ads.example^")]),
        );

        assert_eq!(verdict, Verdict::Allow);
        assert!(session.replay().is_empty());
    }
}
