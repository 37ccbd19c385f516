//! Dynamic insertion observer.
//!
//! After load, pages keep inserting content that element hiding rules match.
//! A page-wide mutation feed re-runs the accumulated hiding selectors on every
//! batch and relocates new matches.

use tracing::{debug, trace};

use adsidebar_core_types::{FeedId, Hit, NodeId};

use crate::host::{DomHost, NodeKind};
use crate::session::PageSession;

#[derive(Debug, Default)]
pub struct InsertionObserver {
    feed: Option<FeedId>,
    batches: u32,
}

impl InsertionObserver {
    pub fn feed(&self) -> Option<FeedId> {
        self.feed
    }

    pub fn is_running(&self) -> bool {
        self.feed.is_some()
    }

    pub fn batches(&self) -> u32 {
        self.batches
    }

    pub(crate) fn stop(&mut self, host: &mut dyn DomHost) {
        if let Some(feed) = self.feed.take() {
            host.disconnect(feed);
        }
    }
}

pub(crate) fn start(session: &mut PageSession, host: &mut dyn DomHost) {
    if session.observer.is_running() {
        return;
    }
    let body = host.document_body();
    session.observer.feed = Some(host.observe(body));
    debug!(target: "adsidebar.observer", page_view = %session.id, "insertion observer started");
}

pub(crate) fn on_batch(session: &mut PageSession, host: &mut dyn DomHost) {
    session.observer.batches += 1;
    relocate_hidden(session, host);
}

/// Live elements matched by the accumulated hiding selectors, keeping only
/// the topmost of nested matches. Matches inside the sidebar chrome, or
/// enclosing it, are never moved.
pub fn collect_hidden(session: &PageSession, host: &dyn DomHost) -> Vec<NodeId> {
    let Some(container) = session.container.as_ref() else {
        return Vec::new();
    };
    let own: Vec<NodeId> = session
        .sidebar
        .root()
        .into_iter()
        .chain(Some(container.root()))
        .collect();
    let overlaps_own = |node: NodeId| {
        own.iter()
            .any(|root| host.contains(*root, node) || host.contains(node, *root))
    };

    let mut matches: Vec<NodeId> = Vec::new();
    for selector in session.hits.iter().filter_map(Hit::selector) {
        for node in host.query_selector_all(selector) {
            if overlaps_own(node) || matches.contains(&node) {
                continue;
            }
            matches.push(node);
        }
    }

    matches
        .iter()
        .copied()
        .filter(|node| {
            !matches
                .iter()
                .any(|other| other != node && host.contains(*other, *node))
        })
        .collect()
}

pub(crate) fn relocate_hidden(session: &mut PageSession, host: &mut dyn DomHost) -> usize {
    let nodes = collect_hidden(session, host);
    if nodes.is_empty() {
        return 0;
    }
    session.ad_stats.hidden_element_count += nodes.len();
    for node in &nodes {
        session.relocate(host, *node);
    }
    debug!(
        target: "adsidebar.observer",
        page_view = %session.id,
        moved = nodes.len(),
        "hidden elements relocated"
    );
    nodes.len()
}

/// Relocation of an element blocked after the page settled. Hiding hits
/// re-run the selector match; any other hit relocates the element itself.
pub(crate) fn insert_dynamic(
    session: &mut PageSession,
    host: &mut dyn DomHost,
    element: NodeId,
    hits: &[Hit],
) {
    if hits.iter().any(Hit::is_elem_hide) {
        relocate_hidden(session, host);
        return;
    }
    if host.kind(element) == NodeKind::Script {
        trace!(target: "adsidebar.observer", page_view = %session.id, %element, "blocked script left in place");
        return;
    }
    if !host.in_page_document(element) {
        return;
    }
    if let Some(root) = session.sidebar.root() {
        if host.contains(root, element) {
            return;
        }
    }
    session.relocate(host, element);
}
