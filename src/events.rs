use serde::Serialize;

use adsidebar_core_types::{NodeId, PageViewId, Phase};

/// Notifications for the sidebar chrome.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SidebarEvent {
    PhaseChanged {
        page_view: PageViewId,
        from: Phase,
        to: Phase,
    },
    /// The confirmed ad count grew. `previous_last_box` is where the chrome
    /// may insert a marker ahead of the new ads.
    NewAdsArrived {
        page_view: PageViewId,
        confirmed_ads: usize,
        last_box: Option<NodeId>,
        previous_last_box: Option<NodeId>,
    },
    Revealed {
        page_view: PageViewId,
    },
    Hidden {
        page_view: PageViewId,
    },
}

impl SidebarEvent {
    pub fn page_view(&self) -> &PageViewId {
        match self {
            SidebarEvent::PhaseChanged { page_view, .. }
            | SidebarEvent::NewAdsArrived { page_view, .. }
            | SidebarEvent::Revealed { page_view }
            | SidebarEvent::Hidden { page_view } => page_view,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SidebarEvent::PhaseChanged { .. } => "phase_changed",
            SidebarEvent::NewAdsArrived { .. } => "new_ads_arrived",
            SidebarEvent::Revealed { .. } => "revealed",
            SidebarEvent::Hidden { .. } => "hidden",
        }
    }
}
