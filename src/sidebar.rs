//! Sidebar chrome state: the fixed-position root the container lives in,
//! display and expansion flags, and the inactivity auto-hide timer.

use tracing::debug;

use adsidebar_core_types::{NodeId, Phase, TimerId};
use adsidebar_policy_center::LayoutPolicy;

use crate::container::px;
use crate::events::SidebarEvent;
use crate::host::DomHost;
use crate::session::PageSession;

pub const SIDEBAR_CLASS: &str = "adsidebar_container";

#[derive(Debug, Default)]
pub struct SidebarChrome {
    root: Option<NodeId>,
    displayed: bool,
    expanded: bool,
    autohide_timer: Option<TimerId>,
    /// Auto-hide was armed by a reveal and not yet consumed.
    autohide_active: bool,
    pointer_inside: bool,
}

impl SidebarChrome {
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn is_displayed(&self) -> bool {
        self.displayed
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn autohide_timer(&self) -> Option<TimerId> {
        self.autohide_timer
    }

    pub fn pointer_inside(&self) -> bool {
        self.pointer_inside
    }

    /// Creates the off-screen sidebar root under `parent`.
    pub(crate) fn attach(
        &mut self,
        host: &mut dyn DomHost,
        parent: NodeId,
        layout: &LayoutPolicy,
    ) -> NodeId {
        if let Some(root) = self.root {
            return root;
        }
        let max_width = f64::from(layout.max_width);
        let root = host.create_element("div");
        host.set_class_name(root, SIDEBAR_CLASS);
        host.set_style(root, "position", "fixed");
        host.set_style(root, "right", &px(-max_width));
        host.set_style(root, "top", "0px");
        host.set_style(root, "width", &px(max_width));
        host.set_style(root, "overflow", "hidden");
        host.append_child(parent, root);
        self.root = Some(root);
        root
    }

    pub(crate) fn cancel_autohide(&mut self, host: &mut dyn DomHost) {
        if let Some(timer) = self.autohide_timer.take() {
            host.clear_timer(timer);
        }
    }

    fn arm_autohide(&mut self, host: &mut dyn DomHost, seconds: u64) {
        self.cancel_autohide(host);
        self.autohide_timer = Some(host.set_timer(seconds.saturating_mul(1_000)));
    }
}

fn width_for(layout: &LayoutPolicy, expanded: bool) -> f64 {
    if expanded {
        f64::from(layout.max_width)
    } else {
        f64::from(layout.box_width)
    }
}

pub(crate) fn show(session: &mut PageSession, host: &mut dyn DomHost) -> bool {
    let Some(root) = session.sidebar.root else {
        return false;
    };
    host.set_style(root, "right", "0px");
    if !session.sidebar.displayed {
        session.sidebar.displayed = true;
        session.emit(SidebarEvent::Revealed {
            page_view: session.id.clone(),
        });
    }
    true
}

pub(crate) fn hide(session: &mut PageSession, host: &mut dyn DomHost) -> bool {
    let Some(root) = session.sidebar.root else {
        return false;
    };
    let width = width_for(&session.policy.layout, session.sidebar.expanded);
    host.set_style(root, "right", &px(-width));
    session.sidebar.cancel_autohide(host);
    session.sidebar.autohide_active = false;
    if session.sidebar.displayed {
        session.sidebar.displayed = false;
        session.emit(SidebarEvent::Hidden {
            page_view: session.id.clone(),
        });
    }
    true
}

pub(crate) fn toggle(session: &mut PageSession, host: &mut dyn DomHost) -> bool {
    if session.sidebar.displayed {
        hide(session, host)
    } else {
        show(session, host)
    }
}

/// Shows the sidebar after new ads arrived and arms auto-hide when configured.
pub(crate) fn reveal(session: &mut PageSession, host: &mut dyn DomHost) {
    let Some(root) = session.sidebar.root else {
        return;
    };
    let width = width_for(&session.policy.layout, session.sidebar.expanded);
    host.set_style(root, "width", &px(width));
    show(session, host);
    host.set_style(root, "z-index", "2147483647");

    let seconds = session.policy.general.autohide_seconds;
    if seconds > 0 {
        session.sidebar.autohide_active = true;
        if !session.sidebar.pointer_inside {
            session.sidebar.arm_autohide(host, seconds);
        }
        debug!(target: "adsidebar.phase", page_view = %session.id, seconds, "auto-hide armed");
    }
}

pub(crate) fn pointer_enter(session: &mut PageSession, host: &mut dyn DomHost) {
    session.sidebar.pointer_inside = true;
    session.sidebar.cancel_autohide(host);
}

pub(crate) fn pointer_leave(session: &mut PageSession, host: &mut dyn DomHost) {
    session.sidebar.pointer_inside = false;
    let seconds = session.policy.general.autohide_seconds;
    if session.sidebar.autohide_active && session.sidebar.displayed && seconds > 0 {
        session.sidebar.arm_autohide(host, seconds);
    }
}

/// Returns false when `timer` is not the auto-hide timer.
pub(crate) fn on_autohide_timer(
    session: &mut PageSession,
    host: &mut dyn DomHost,
    timer: TimerId,
) -> bool {
    if session.sidebar.autohide_timer != Some(timer) {
        return false;
    }
    session.sidebar.autohide_timer = None;
    debug!(target: "adsidebar.phase", page_view = %session.id, "sidebar idle, hiding");
    hide(session, host);
    true
}

/// Switches between the box cell width and the expanded size. Relocated boxes
/// are restyled only once they have been styled the first time and no round
/// is in progress.
pub(crate) fn set_expanded(session: &mut PageSession, host: &mut dyn DomHost, expanded: bool) {
    session.sidebar.expanded = expanded;
    let layout = session.policy.layout.clone();
    if let Some(root) = session.sidebar.root {
        host.set_style(root, "width", &px(width_for(&layout, expanded)));
        if !session.sidebar.displayed {
            host.set_style(root, "right", &px(-width_for(&layout, expanded)));
        }
    }
    if session.monitor.is_polling() || session.phase < Phase::AdMonitorComplete {
        return;
    }
    let scaling = session.policy.general.ad_scaling_enabled;
    if let Some(container) = session.container.as_ref() {
        container.apply_styles(host, &layout, expanded, scaling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDom;
    use adsidebar_core_types::PageViewId;
    use adsidebar_policy_center::default_snapshot;
    use std::sync::Arc;

    fn attached(autohide_seconds: u64) -> (SimDom, PageSession) {
        let mut policy = default_snapshot();
        policy.general.autohide_seconds = autohide_seconds;
        let mut dom = SimDom::new();
        let mut session = PageSession::new(PageViewId::new(), "https://example.com/", Arc::new(policy));
        let body = dom.document_body();
        let layout = session.policy.layout.clone();
        session.sidebar.attach(&mut dom, body, &layout);
        (dom, session)
    }

    #[test]
    fn hide_moves_the_root_off_screen_by_its_width() {
        let (mut dom, mut session) = attached(0);
        let root = session.sidebar.root().unwrap();

        assert!(show(&mut session, &mut dom));
        assert_eq!(dom.style(root, "right").as_deref(), Some("0px"));

        assert!(hide(&mut session, &mut dom));
        assert_eq!(dom.style(root, "right").as_deref(), Some("-200px"));

        set_expanded(&mut session, &mut dom, true);
        toggle(&mut session, &mut dom);
        toggle(&mut session, &mut dom);
        assert_eq!(dom.style(root, "right").as_deref(), Some("-800px"));

        let names: Vec<_> = session.take_events().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["revealed", "hidden", "revealed", "hidden"]);
    }

    #[test]
    fn pointer_presence_suspends_auto_hide() {
        let (mut dom, mut session) = attached(3);
        reveal(&mut session, &mut dom);
        assert!(session.sidebar.autohide_timer().is_some());

        pointer_enter(&mut session, &mut dom);
        assert!(session.sidebar.autohide_timer().is_none());

        pointer_leave(&mut session, &mut dom);
        let timer = session.sidebar.autohide_timer().unwrap();
        assert!(on_autohide_timer(&mut session, &mut dom, timer));
        assert!(!session.sidebar.is_displayed());

        pointer_leave(&mut session, &mut dom);
        assert!(session.sidebar.autohide_timer().is_none());
    }
}
