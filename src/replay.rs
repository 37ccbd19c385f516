//! Sequential replay of elements captured before the page finished loading.
//!
//! Exactly one item is in flight at a time. Frames and scripts hold the queue
//! until their armed settle signal arrives; plain elements are relocated
//! straight away. While a replayed script is outstanding, page writes are
//! intercepted and materialised into the script's private box.

use std::collections::VecDeque;

use tracing::{debug, trace};

use adsidebar_core_types::NodeId;

use crate::host::{DomHost, NodeKind, SettleOutcome};
use crate::metrics;
use crate::model::{InlineScript, PendingItem, ReplayStats};
use crate::phase;
use crate::session::PageSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Frame,
    Script,
}

#[derive(Debug, Default)]
pub struct ReplayQueue {
    items: VecDeque<PendingItem>,
    in_flight: Option<InFlight>,
    armed: Option<NodeId>,
    write_target: Option<NodeId>,
    write_buffer: String,
    interception_installed: bool,
    finished: bool,
    stats: ReplayStats,
}

impl ReplayQueue {
    pub fn enqueue(&mut self, item: PendingItem) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingItem> {
        self.items.iter()
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Element whose settle signal the queue is waiting for.
    pub fn armed(&self) -> Option<NodeId> {
        self.armed
    }

    pub fn write_buffer(&self) -> &str {
        &self.write_buffer
    }

    pub fn interception_installed(&self) -> bool {
        self.interception_installed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Arming a new element disarms the previous one.
    fn arm(&mut self, host: &mut dyn DomHost, node: NodeId) {
        if let Some(previous) = self.armed.replace(node) {
            if previous != node {
                host.disarm_settle(previous);
            }
        }
        host.arm_settle(node);
    }

    fn release_interception(&mut self, host: &mut dyn DomHost) {
        self.write_target = None;
        if self.interception_installed {
            host.remove_write_interception();
            self.interception_installed = false;
        }
    }

    pub(crate) fn teardown(&mut self, host: &mut dyn DomHost) {
        self.items.clear();
        self.in_flight = None;
        if let Some(node) = self.armed.take() {
            host.disarm_settle(node);
        }
        self.release_interception(host);
    }
}

/// Captures a blocked element for later replay. Scripts are captured by value.
pub fn capture(host: &dyn DomHost, element: NodeId) -> PendingItem {
    match host.kind(element) {
        NodeKind::Script => host
            .script_descriptor(element)
            .map(PendingItem::Script)
            .unwrap_or(PendingItem::PlainElement(element)),
        NodeKind::Frame => PendingItem::FrameElement(element),
        _ => PendingItem::PlainElement(element),
    }
}

pub(crate) fn start(session: &mut PageSession, host: &mut dyn DomHost) {
    debug!(
        target: "adsidebar.replay",
        page_view = %session.id,
        queued = session.replay.len(),
        "replay started"
    );
    process_next(session, host);
}

/// Dequeues until an item has to wait for a settle signal or the queue is dry.
pub(crate) fn process_next(session: &mut PageSession, host: &mut dyn DomHost) {
    loop {
        if session.replay.in_flight.is_some() {
            return;
        }
        let Some(item) = session.replay.items.pop_front() else {
            if !session.replay.finished {
                session.replay.finished = true;
                debug!(
                    target: "adsidebar.replay",
                    page_view = %session.id,
                    replayed = session.replay.stats.replayed_count,
                    dead = session.replay.stats.dead_item_count,
                    "replay queue exhausted"
                );
                phase::replay_exhausted(session, host);
            }
            return;
        };

        match item {
            PendingItem::PlainElement(node) => {
                if !host.is_alive(node) {
                    record_dead(session, node);
                    continue;
                }
                if already_relocated(session, host, node) {
                    trace!(target: "adsidebar.replay", page_view = %session.id, %node, "already moved by hiding rules");
                    continue;
                }
                session.relocate(host, node);
                record_replayed(session);
            }
            PendingItem::FrameElement(node) => {
                if !host.is_alive(node) {
                    record_dead(session, node);
                    continue;
                }
                if already_relocated(session, host, node) {
                    trace!(target: "adsidebar.replay", page_view = %session.id, %node, "already moved by hiding rules");
                    continue;
                }
                session.replay.arm(host, node);
                session.replay.in_flight = Some(InFlight::Frame);
                session.relocate(host, node);
                record_replayed(session);
                return;
            }
            PendingItem::Script(descriptor) => {
                let script = host.create_script(&descriptor);
                session.replay.arm(host, script);
                let target = host.create_element("div");
                host.append_child(target, script);
                session.replay.write_target = Some(target);
                if !session.replay.interception_installed {
                    host.install_write_interception();
                    session.replay.interception_installed = true;
                }
                session.replay.in_flight = Some(InFlight::Script);
                trace!(
                    target: "adsidebar.replay",
                    page_view = %session.id,
                    src = descriptor.source_url.as_deref().unwrap_or(""),
                    "script re-created"
                );
                session.relocate(host, target);
                record_replayed(session);
                return;
            }
        }
    }
}

pub(crate) fn on_settled(
    session: &mut PageSession,
    host: &mut dyn DomHost,
    node: NodeId,
    outcome: SettleOutcome,
) {
    if session.replay.armed != Some(node) {
        trace!(target: "adsidebar.replay", page_view = %session.id, %node, "stale settle signal ignored");
        return;
    }
    session.replay.armed = None;
    host.disarm_settle(node);
    if outcome == SettleOutcome::Errored {
        session.script_error = true;
        debug!(target: "adsidebar.replay", page_view = %session.id, %node, "replayed element failed to load");
    }
    if session.replay.in_flight.take() == Some(InFlight::Script) {
        session.replay.release_interception(host);
    }
    process_next(session, host);
}

/// Handles one intercepted page write while a replayed script is outstanding.
pub(crate) fn on_document_write(session: &mut PageSession, host: &mut dyn DomHost, markup: &str) {
    session.replay.stats.doc_write_count += 1;
    let Some(target) = session.replay.write_target else {
        debug!(target: "adsidebar.replay", page_view = %session.id, "write outside script replay ignored");
        return;
    };
    session.replay.write_buffer.push_str(markup);
    let nodes = host.parse_fragment(&session.replay.write_buffer);
    if nodes.is_empty() {
        trace!(
            target: "adsidebar.replay",
            page_view = %session.id,
            buffered = session.replay.write_buffer.len(),
            "partial write buffered"
        );
        return;
    }
    session.replay.write_buffer.clear();
    for node in &nodes {
        host.append_child(target, *node);
    }
    let sentinel = host.create_inline_script(&InlineScript::sentinel());
    session.replay.arm(host, sentinel);
    host.append_child(target, sentinel);
    debug!(
        target: "adsidebar.replay",
        page_view = %session.id,
        nodes = nodes.len(),
        %sentinel,
        "written markup inserted"
    );
}

fn already_relocated(session: &PageSession, host: &dyn DomHost, node: NodeId) -> bool {
    session
        .container
        .as_ref()
        .map(|container| host.contains(container.root(), node))
        .unwrap_or(false)
}

fn record_dead(session: &mut PageSession, node: NodeId) {
    session.replay.stats.dead_item_count += 1;
    metrics::record_dead_item();
    debug!(target: "adsidebar.replay", page_view = %session.id, %node, "queued element is gone, skipping");
}

fn record_replayed(session: &mut PageSession) {
    session.replay.stats.replayed_count += 1;
    metrics::record_replayed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptDescriptor;
    use crate::sim::SimDom;
    use adsidebar_core_types::{Hit, PageViewId, Phase, PolicyDecision};
    use adsidebar_policy_center::default_snapshot;
    use std::sync::Arc;

    #[test]
    fn capture_tags_items_by_kind() {
        let dom = SimDom::from_markup(
            r#"<script id="s" src="https://ads.example/tag.js" async></script>
               <iframe id="f" src="https://ads.example/frame"></iframe>
               <div id="d"></div>"#,
        );
        let script = dom.find("#s").unwrap();
        let frame = dom.find("#f").unwrap();
        let div = dom.find("#d").unwrap();

        assert_eq!(
            capture(&dom, script),
            PendingItem::Script(ScriptDescriptor {
                script_type: String::new(),
                source_url: Some("https://ads.example/tag.js".into()),
                is_async: true,
                id: Some("s".into()),
            })
        );
        assert_eq!(capture(&dom, frame), PendingItem::FrameElement(frame));
        assert_eq!(capture(&dom, div), PendingItem::PlainElement(div));
    }

    #[test]
    fn frames_moved_by_hiding_rules_are_not_replayed_again() {
        let mut dom = SimDom::from_markup(
            r#"<iframe id="f" class="ad" src="https://ads.example/frame"></iframe>"#,
        );
        let mut session = PageSession::new(
            PageViewId::new(),
            "https://example.com/",
            Arc::new(default_snapshot()),
        );
        let frame = dom.find("#f").unwrap();
        let decision = PolicyDecision::block(vec![
            Hit::blocking("||ads.example^$subdocument"),
            Hit::elem_hide("##iframe.ad"),
        ]);
        phase::policy_decision(&mut session, &mut dom, frame, &decision);

        phase::window_loaded(&mut session, &mut dom);

        let container = session.container().unwrap();
        assert!(dom.contains(container.root(), frame));
        assert_eq!(container.relocated_count(), 1);
        assert_eq!(session.replay().armed(), None);
        assert_eq!(session.replay().stats().replayed_count, 0);
        assert_eq!(session.phase(), Phase::AdMonitorStarted);
    }
}
