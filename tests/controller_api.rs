use std::sync::Arc;

use tokio::sync::broadcast::Receiver;

use adsidebar::sim::{HostCallback, ScriptBehavior, SimDom};
use adsidebar::{
    AdSidebar, DomHost, EngineError, Hit, PageViewId, Phase, PolicyDecision, SidebarEvent, Verdict,
};
use adsidebar_policy_center::{default_snapshot, InMemoryPolicyCenter, PolicySnapshot};

const MAX_CALLBACKS: usize = 10_000;

struct Harness {
    sidebar: AdSidebar,
    dom: SimDom,
    page: PageViewId,
    events: Receiver<SidebarEvent>,
}

impl Harness {
    fn new(snapshot: PolicySnapshot) -> Self {
        let sidebar = AdSidebar::new(Arc::new(InMemoryPolicyCenter::new(snapshot)));
        let events = sidebar.subscribe();
        let page = sidebar
            .open_page("https://www.example.com/article", true)
            .expect("registry accepts a fresh page view")
            .expect("top-level page is tracked");
        Self {
            sidebar,
            dom: SimDom::new(),
            page,
            events,
        }
    }

    fn block(&mut self, markup: &str) -> Verdict {
        let body = self.dom.document_body();
        let node = self.dom.append_markup(body, markup)[0];
        let decision = PolicyDecision::block(vec![Hit::blocking("||ads.example^")]);
        let verdict = self
            .sidebar
            .on_policy_decision(&self.page, &mut self.dom, node, &decision);
        if verdict == Verdict::Block {
            self.dom.set_blocked(node);
        }
        verdict
    }

    fn load(&mut self) {
        self.sidebar.on_window_load(&self.page, &mut self.dom);
    }

    /// Dispatches one callback, returning it for inspection.
    fn step(&mut self) -> Option<HostCallback> {
        let callback = self.dom.next_callback()?;
        let dom = &mut self.dom;
        match callback.clone() {
            HostCallback::Timer(timer) => self.sidebar.on_timer(&self.page, dom, timer),
            HostCallback::Settle(node, outcome) => {
                self.sidebar.on_element_settled(&self.page, dom, node, outcome)
            }
            HostCallback::Mutations(feed) => self.sidebar.on_mutations(&self.page, dom, feed),
            HostCallback::DocumentWrite(markup) => {
                self.sidebar.on_document_write(&self.page, dom, &markup)
            }
            HostCallback::ScriptError => self.sidebar.on_script_error(&self.page),
        }
        Some(callback)
    }

    fn step_until(&mut self, mut done: impl FnMut(&HostCallback) -> bool) {
        for _ in 0..MAX_CALLBACKS {
            let callback = self.step().expect("host went idle first");
            if done(&callback) {
                return;
            }
        }
        panic!("condition not reached");
    }

    fn settle(&mut self) {
        for _ in 0..MAX_CALLBACKS {
            if self.step().is_none() {
                return;
            }
        }
        panic!("host never went idle");
    }

    fn drain_events(&mut self) -> Vec<SidebarEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn is_write(callback: &HostCallback) -> bool {
    matches!(callback, HostCallback::DocumentWrite(_))
}

#[test]
fn replay_waits_for_the_sentinel_after_the_last_chunk() {
    let mut h = Harness::new(default_snapshot());
    h.dom.define_script(
        "https://ads.example/writer.js",
        ScriptBehavior {
            writes: vec![
                r#"<div class="written""#.to_string(),
                r#"><img width="300" height="250"></div>"#.to_string(),
            ],
            ..ScriptBehavior::default()
        },
    );
    h.block(r#"<script src="https://ads.example/writer.js"></script>"#);
    h.block(r#"<div id="after"><img width="300" height="250"></div>"#);
    h.load();
    assert!(h.dom.interception_installed());

    h.step_until(is_write);
    let stats = h.sidebar.stats(&h.page).unwrap();
    assert_eq!(stats.replay.doc_write_count, 1);
    assert_eq!(stats.queued_items, 1);
    assert_eq!(stats.relocated_count, 1);
    assert!(h.dom.find(".written").is_none());

    h.step_until(is_write);
    let stats = h.sidebar.stats(&h.page).unwrap();
    assert_eq!(stats.replay.doc_write_count, 2);
    assert_eq!(stats.queued_items, 1);
    assert_eq!(stats.phase, Phase::ReplayStarted);
    assert!(h.dom.find(".adsidebar_ad_container .written").is_some());

    h.settle();
    let stats = h.sidebar.stats(&h.page).unwrap();
    assert_eq!(stats.queued_items, 0);
    assert_eq!(stats.relocated_count, 2);
    assert_eq!(stats.phase, Phase::Done);
    assert!(!h.dom.interception_installed());
}

#[test]
fn blocked_decisions_before_load_are_held() {
    let mut h = Harness::new(default_snapshot());
    assert_eq!(h.block(r#"<div class="ad"></div>"#), Verdict::Block);
    let stats = h.sidebar.stats(&h.page).unwrap();
    assert_eq!(stats.queued_items, 1);
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.phase, Phase::Init);
}

#[test]
fn unblocked_decisions_are_allowed() {
    let mut h = Harness::new(default_snapshot());
    let body = h.dom.document_body();
    let node = h.dom.append_markup(body, "<p>text</p>")[0];
    let verdict =
        h.sidebar
            .on_policy_decision(&h.page, &mut h.dom, node, &PolicyDecision::allow());
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(h.sidebar.stats(&h.page).unwrap().queued_items, 0);
}

#[test]
fn disabled_engine_passes_the_external_decision_through() {
    let mut snapshot = default_snapshot();
    snapshot.general.enabled = false;
    let mut h = Harness::new(snapshot);

    assert_eq!(h.block(r#"<div class="ad"></div>"#), Verdict::Block);
    let stats = h.sidebar.stats(&h.page).unwrap();
    assert_eq!(stats.queued_items, 0);
    assert_eq!(stats.hit_count, 0);
}

#[test]
fn decisions_for_unknown_pages_block() {
    let mut h = Harness::new(default_snapshot());
    let body = h.dom.document_body();
    let node = h.dom.append_markup(body, r#"<div class="ad"></div>"#)[0];
    let stranger = PageViewId::new();
    let decision = PolicyDecision::block(vec![Hit::blocking("||ads.example^")]);

    assert_eq!(
        h.sidebar
            .on_policy_decision(&stranger, &mut h.dom, node, &decision),
        Verdict::Block
    );
}

#[test]
fn sub_frames_get_no_session() {
    let sidebar = AdSidebar::new(Arc::new(InMemoryPolicyCenter::new(default_snapshot())));
    assert!(sidebar
        .open_page("https://ads.example/frame", false)
        .unwrap()
        .is_none());
    assert!(sidebar.active_pages().is_empty());

    let page = sidebar
        .open_page("https://www.example.com/", true)
        .unwrap()
        .unwrap();
    assert_eq!(sidebar.active_pages(), vec![page]);
}

#[test]
fn chrome_operations_need_the_sidebar() {
    let mut h = Harness::new(default_snapshot());
    let err = h.sidebar.show(&h.page, &mut h.dom).unwrap_err();
    assert!(matches!(err, EngineError::SidebarNotReady(_)));

    h.load();
    h.sidebar.show(&h.page, &mut h.dom).unwrap();
    h.sidebar.toggle(&h.page, &mut h.dom).unwrap();
    assert!(!h.sidebar.stats(&h.page).unwrap().displayed);

    let names: Vec<_> = h.drain_events().iter().map(SidebarEvent::name).collect();
    assert!(names.ends_with(&["revealed", "hidden"]));
}

#[test]
fn close_releases_host_resources_and_is_idempotent() {
    let mut h = Harness::new(default_snapshot());
    h.dom.define_script(
        "https://ads.example/slow.js",
        ScriptBehavior {
            load_ms: 5_000,
            ..ScriptBehavior::default()
        },
    );
    h.block(r#"<script src="https://ads.example/slow.js"></script>"#);
    h.load();
    assert!(h.dom.interception_installed());
    assert_eq!(h.dom.armed_count(), 1);
    assert!(h.dom.active_feeds() > 0);

    let page = h.page.clone();
    h.sidebar.close_page(&page, &mut h.dom);
    h.sidebar.close_page(&page, &mut h.dom);

    assert!(!h.dom.interception_installed());
    assert_eq!(h.dom.armed_count(), 0);
    assert_eq!(h.dom.active_feeds(), 0);
    assert_eq!(h.dom.active_timers(), 0);
    assert!(matches!(
        h.sidebar.stats(&page),
        Err(EngineError::UnknownPageView(_))
    ));
    assert!(h.sidebar.active_pages().is_empty());

    // late callbacks for the closed page are ignored
    h.settle();
    assert_eq!(h.dom.active_timers(), 0);
}

#[test]
fn closing_before_load_is_harmless() {
    let mut h = Harness::new(default_snapshot());
    let page = h.page.clone();
    h.sidebar.close_page(&page, &mut h.dom);
    h.sidebar.on_window_load(&page, &mut h.dom);

    assert!(h.dom.find(".adsidebar_container").is_none());
    assert_eq!(h.dom.active_feeds(), 0);
}

#[test]
fn duplicate_load_signal_is_ignored() {
    let mut h = Harness::new(default_snapshot());
    h.block(r#"<div id="ad"><img width="300" height="250"></div>"#);
    h.load();
    h.load();
    h.settle();

    let phases: Vec<Phase> = h
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SidebarEvent::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(phases.iter().filter(|p| **p == Phase::WindowLoaded).count(), 1);
    assert_eq!(h.sidebar.stats(&h.page).unwrap().relocated_count, 1);
}

#[test]
fn pointer_inside_keeps_the_sidebar_open() {
    let mut snapshot = default_snapshot();
    snapshot.general.autohide_seconds = 1;
    let mut h = Harness::new(snapshot);
    h.block(r#"<div id="ad"><img width="300" height="250"></div>"#);
    h.load();

    while !h.sidebar.stats(&h.page).unwrap().displayed {
        h.step().expect("sidebar revealed before the host went idle");
    }
    h.sidebar.on_pointer_enter(&h.page, &mut h.dom);
    h.settle();
    assert!(h.sidebar.stats(&h.page).unwrap().displayed);

    h.sidebar.on_pointer_leave(&h.page, &mut h.dom);
    h.settle();
    assert!(!h.sidebar.stats(&h.page).unwrap().displayed);
}

#[test]
fn new_ads_event_points_at_the_previous_last_box() {
    let mut h = Harness::new(default_snapshot());
    h.block(r#"<div id="first"><img width="300" height="250"></div>"#);
    h.load();
    h.settle();

    assert_eq!(h.block(r#"<div id="late"><img width="300" height="250"></div>"#), Verdict::Allow);
    h.settle();

    let arrivals: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            SidebarEvent::NewAdsArrived {
                confirmed_ads,
                last_box,
                previous_last_box,
                ..
            } => Some((confirmed_ads, last_box, previous_last_box)),
            _ => None,
        })
        .collect();
    assert_eq!(arrivals.len(), 2);
    assert_eq!(arrivals[0].0, 1);
    assert_eq!(arrivals[0].2, None);
    assert_eq!(arrivals[1].0, 2);
    assert_eq!(arrivals[1].2, arrivals[0].1);
    assert_ne!(arrivals[1].1, arrivals[0].1);
}
