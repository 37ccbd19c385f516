//! Deterministic in-memory document with a virtual clock.
//!
//! Nothing runs on its own: every asynchronous effect (script execution, frame
//! loads, mutation delivery, timers, settle signals) is a task on the clock and
//! surfaces through [`SimDom::next_callback`], which the driver routes to the
//! controller.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use adsidebar_core_types::{FeedId, NodeId, TimerId};

use crate::host::{DomHost, FrameReadyState, NodeKind, SettleOutcome, Size};
use crate::model::{InlineScript, ScriptDescriptor};

use super::markup::{self, ParsedNode, NODE_ID_ATTR};

const BODY: NodeId = NodeId(0);
const TEXT_TAG: &str = "#text";
const DEFAULT_SCRIPT_LOAD_MS: u64 = 10;
const CHAR_WIDTH_PX: f64 = 6.0;
const LINE_HEIGHT_PX: f64 = 16.0;

/// How a script fetched from `src` behaves once connected.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptBehavior {
    pub load_ms: u64,
    /// Settles with an error instead of loading.
    pub error: bool,
    /// Raises a page-level script error while running.
    pub throws: bool,
    /// Chunks passed to the page's write entry point, in order.
    pub writes: Vec<String>,
}

impl Default for ScriptBehavior {
    fn default() -> Self {
        Self {
            load_ms: DEFAULT_SCRIPT_LOAD_MS,
            error: false,
            throws: false,
            writes: Vec::new(),
        }
    }
}

/// How a frame pointing at `src` behaves once connected.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameBehavior {
    pub complete_ms: u64,
    /// Rendered size of the inner body once complete, `None` for no body.
    pub body: Option<[f64; 2]>,
    /// Cross-origin frames expose neither ready state nor body.
    pub accessible: bool,
    /// Body size after a third-party ad refresh.
    pub body_after_refresh: Option<[f64; 2]>,
}

impl Default for FrameBehavior {
    fn default() -> Self {
        Self {
            complete_ms: 100,
            body: Some([300.0, 250.0]),
            accessible: true,
            body_after_refresh: None,
        }
    }
}

/// Asynchronous notification for the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum HostCallback {
    Timer(TimerId),
    Settle(NodeId, SettleOutcome),
    Mutations(FeedId),
    DocumentWrite(String),
    ScriptError,
}

#[derive(Debug)]
enum Task {
    Timer(TimerId),
    RunScript(NodeId),
    CompleteFrame { node: NodeId, generation: u64 },
    Settle(NodeId, SettleOutcome),
    DeliverMutations(FeedId),
    Emit(HostCallback),
}

#[derive(Debug, Clone)]
struct FrameState {
    ready: FrameReadyState,
    body: Option<Size>,
    generation: u64,
}

#[derive(Debug, Clone)]
struct SimNode {
    tag: String,
    kind: NodeKind,
    attrs: Vec<(String, String)>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    styles: BTreeMap<String, String>,
    alive: bool,
    blocked: bool,
    executed: bool,
    frame: Option<FrameState>,
}

impl SimNode {
    fn element(tag: &str) -> Self {
        let tag = tag.to_ascii_lowercase();
        let kind = match tag.as_str() {
            "iframe" | "frame" | "object" | "embed" => NodeKind::Frame,
            "img" | "video" | "canvas" | "picture" => NodeKind::Image,
            "script" => NodeKind::Script,
            _ => NodeKind::Element,
        };
        Self {
            tag,
            kind,
            attrs: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
            styles: BTreeMap::new(),
            alive: true,
            blocked: false,
            executed: false,
            frame: None,
        }
    }

    fn text(content: &str) -> Self {
        let mut node = Self::element(TEXT_TAG);
        node.kind = NodeKind::Text;
        node.text = content.to_string();
        node
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }
}

#[derive(Debug)]
struct Feed {
    target: NodeId,
    pending: usize,
    delivery_queued: bool,
}

pub struct SimDom {
    nodes: Vec<SimNode>,
    now: u64,
    seq: u64,
    tasks: BTreeMap<(u64, u64), Task>,
    next_id: u64,
    timers: HashSet<TimerId>,
    feeds: HashMap<FeedId, Feed>,
    armed: HashSet<NodeId>,
    write_interception: bool,
    scripts: HashMap<String, ScriptBehavior>,
    frames: HashMap<String, FrameBehavior>,
    ad_refresh_api: bool,
    page_ready_hook: bool,
    ready_hook_overridden: bool,
    refresh_calls: u32,
    inline_runs: u32,
    dropped_writes: u32,
}

impl Default for SimDom {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDom {
    pub fn new() -> Self {
        Self {
            nodes: vec![SimNode::element("body")],
            now: 0,
            seq: 0,
            tasks: BTreeMap::new(),
            next_id: 1,
            timers: HashSet::new(),
            feeds: HashMap::new(),
            armed: HashSet::new(),
            write_interception: false,
            scripts: HashMap::new(),
            frames: HashMap::new(),
            ad_refresh_api: false,
            page_ready_hook: false,
            ready_hook_overridden: false,
            refresh_calls: 0,
            inline_runs: 0,
            dropped_writes: 0,
        }
    }

    /// Document whose body holds `markup`. Unparsable markup leaves it empty.
    pub fn from_markup(markup: &str) -> Self {
        let mut dom = Self::new();
        dom.append_markup(BODY, markup);
        dom
    }

    pub fn define_script(&mut self, src: impl Into<String>, behavior: ScriptBehavior) {
        self.scripts.insert(src.into(), behavior);
    }

    pub fn define_frame(&mut self, src: impl Into<String>, behavior: FrameBehavior) {
        self.frames.insert(src.into(), behavior);
    }

    pub fn set_ad_refresh_api(&mut self, present: bool) {
        self.ad_refresh_api = present;
    }

    pub fn set_page_ready_hook(&mut self, present: bool) {
        self.page_ready_hook = present;
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls
    }

    /// Inline scripts executed so far, page scripts included.
    pub fn inline_runs(&self) -> u32 {
        self.inline_runs
    }

    pub fn ready_hook_overridden(&self) -> bool {
        self.ready_hook_overridden
    }

    /// Page writes that arrived while no interception was installed.
    pub fn dropped_writes(&self) -> u32 {
        self.dropped_writes
    }

    pub fn interception_installed(&self) -> bool {
        self.write_interception
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn active_feeds(&self) -> usize {
        self.feeds.len()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Parses `markup` into detached nodes without connecting them.
    pub fn build_fragment(&mut self, markup: &str) -> Vec<NodeId> {
        markup::parse_fragment(markup)
            .iter()
            .map(|node| self.materialize(node))
            .collect()
    }

    /// Parses `markup` and appends the result under `parent`.
    pub fn append_markup(&mut self, parent: NodeId, markup: &str) -> Vec<NodeId> {
        let nodes = self.build_fragment(markup);
        if nodes.is_empty() && !markup.trim().is_empty() {
            warn!(target: "adsidebar.sim", "markup did not parse, nothing appended");
        }
        for node in &nodes {
            self.append_child(parent, *node);
        }
        nodes
    }

    /// Marks `node` as held back by the content blocker. Held nodes neither
    /// load nor execute until they are moved.
    pub fn set_blocked(&mut self, node: NodeId) {
        if let Some(n) = self.node_mut(node) {
            n.blocked = true;
            n.styles.insert("display".into(), "none".into());
        }
    }

    /// The page discards `node`; its handle goes stale.
    pub fn destroy(&mut self, node: NodeId) {
        if node == BODY {
            return;
        }
        self.remove_from_parent(node);
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if let Some(n) = self.node_mut(current) {
                n.alive = false;
                stack.extend(n.children.iter().copied());
            }
        }
    }

    /// First connected match of `selector` in document order.
    pub fn find(&self, selector: &str) -> Option<NodeId> {
        self.query_selector_all(selector).into_iter().next()
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.node(node)?.attr(name)
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.node(node).map(|n| n.tag.as_str())
    }

    /// Delivers the next callback, advancing the clock to it.
    pub fn next_callback(&mut self) -> Option<HostCallback> {
        self.next_callback_until(u64::MAX)
    }

    /// Like [`SimDom::next_callback`] but never moves past `deadline`.
    pub fn next_callback_until(&mut self, deadline: u64) -> Option<HostCallback> {
        loop {
            let (&key, _) = self.tasks.first_key_value()?;
            if key.0 > deadline {
                return None;
            }
            let task = self.tasks.remove(&key)?;
            self.now = self.now.max(key.0);
            if let Some(callback) = self.run_task(task) {
                return Some(callback);
            }
        }
    }

    /// Moves the clock forward without running anything.
    pub fn advance_to(&mut self, time: u64) {
        self.now = self.now.max(time);
    }

    /// Runs every pending task, dropping the callbacks. For tests that only
    /// need the document to finish loading.
    pub fn run_until_idle(&mut self) -> usize {
        let mut dropped = 0;
        while self.next_callback().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    fn node(&self, id: NodeId) -> Option<&SimNode> {
        self.nodes.get(id.0 as usize)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id.0 as usize)
    }

    fn push_node(&mut self, node: SimNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u64);
        self.nodes.push(node);
        id
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn schedule(&mut self, delay_ms: u64, task: Task) {
        let at = self.now.saturating_add(delay_ms);
        self.seq += 1;
        self.tasks.insert((at, self.seq), task);
    }

    fn materialize(&mut self, parsed: &ParsedNode) -> NodeId {
        match parsed {
            ParsedNode::Text(text) => self.push_node(SimNode::text(text)),
            ParsedNode::Element {
                tag,
                attrs,
                text,
                children,
            } => {
                let mut node = SimNode::element(tag);
                node.attrs = attrs.clone();
                node.text = text.clone();
                if let Some(style) = node.attr("style").map(str::to_string) {
                    for decl in style.split(';') {
                        if let Some((prop, value)) = decl.split_once(':') {
                            node.styles
                                .insert(prop.trim().to_ascii_lowercase(), value.trim().to_string());
                        }
                    }
                }
                let id = self.push_node(node);
                for child in children {
                    let child_id = self.materialize(child);
                    if let Some(n) = self.node_mut(child_id) {
                        n.parent = Some(id);
                    }
                    if let Some(n) = self.node_mut(id) {
                        n.children.push(child_id);
                    }
                }
                id
            }
        }
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.contains(BODY, node)
    }

    fn held_back(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            match self.node(id) {
                Some(n) if n.blocked => return true,
                Some(n) => current = n.parent,
                None => return false,
            }
        }
        false
    }

    fn is_displayed(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            match self.node(id) {
                Some(n) if n.styles.get("display").map(String::as_str) == Some("none") => {
                    return false
                }
                Some(n) => current = n.parent,
                None => return false,
            }
        }
        true
    }

    /// Queues a record for every feed whose target contains `changed`.
    fn record_mutation(&mut self, changed: NodeId) {
        let targets: Vec<(FeedId, NodeId)> = self
            .feeds
            .iter()
            .map(|(id, feed)| (*id, feed.target))
            .collect();
        for (feed_id, target) in targets {
            if !self.contains(target, changed) {
                continue;
            }
            let mut queue = false;
            if let Some(feed) = self.feeds.get_mut(&feed_id) {
                feed.pending += 1;
                if !feed.delivery_queued {
                    feed.delivery_queued = true;
                    queue = true;
                }
            }
            if queue {
                self.schedule(0, Task::DeliverMutations(feed_id));
            }
        }
    }

    /// Starts loads and script execution for a subtree that just became
    /// part of the document.
    fn activate(&mut self, root: NodeId) {
        let mut subtree = vec![root];
        subtree.extend(self.descendants(root));
        for node in subtree {
            if self.held_back(node) {
                continue;
            }
            let Some(n) = self.node(node) else {
                continue;
            };
            match n.kind {
                NodeKind::Script if !n.executed => {
                    let src = n.attr("src").map(str::to_string);
                    if let Some(n) = self.node_mut(node) {
                        n.executed = true;
                    }
                    match src {
                        Some(src) => {
                            let load_ms = self
                                .scripts
                                .get(&src)
                                .map(|b| b.load_ms)
                                .unwrap_or(DEFAULT_SCRIPT_LOAD_MS);
                            self.schedule(load_ms, Task::RunScript(node));
                        }
                        None => {
                            self.inline_runs += 1;
                            self.schedule(0, Task::Settle(node, SettleOutcome::Loaded));
                        }
                    }
                }
                NodeKind::Frame => {
                    let src = n.attr("src").unwrap_or_default().to_string();
                    let behavior = self.frames.get(&src).cloned().unwrap_or_default();
                    let generation = n.frame.as_ref().map(|f| f.generation + 1).unwrap_or(1);
                    if let Some(n) = self.node_mut(node) {
                        n.frame = Some(FrameState {
                            ready: FrameReadyState::Loading,
                            body: None,
                            generation,
                        });
                    }
                    self.schedule(
                        behavior.complete_ms,
                        Task::CompleteFrame { node, generation },
                    );
                }
                _ => {}
            }
        }
    }

    fn run_task(&mut self, task: Task) -> Option<HostCallback> {
        match task {
            Task::Timer(timer) => self.timers.remove(&timer).then_some(HostCallback::Timer(timer)),
            Task::Settle(node, outcome) => self
                .armed
                .remove(&node)
                .then_some(HostCallback::Settle(node, outcome)),
            Task::DeliverMutations(feed_id) => {
                let feed = self.feeds.get_mut(&feed_id)?;
                feed.delivery_queued = false;
                if feed.pending == 0 {
                    return None;
                }
                feed.pending = 0;
                Some(HostCallback::Mutations(feed_id))
            }
            Task::Emit(callback) => {
                if let HostCallback::DocumentWrite(_) = callback {
                    if !self.write_interception {
                        self.dropped_writes += 1;
                        trace!(target: "adsidebar.sim", "write without interception dropped");
                        return None;
                    }
                }
                Some(callback)
            }
            Task::RunScript(node) => {
                if !self.is_alive(node) || !self.is_connected(node) || self.held_back(node) {
                    trace!(target: "adsidebar.sim", %node, "held back script not executed");
                    return None;
                }
                let src = self.node(node)?.attr("src").unwrap_or_default().to_string();
                let behavior = self.scripts.get(&src).cloned().unwrap_or_default();
                for chunk in behavior.writes {
                    self.schedule(0, Task::Emit(HostCallback::DocumentWrite(chunk)));
                }
                if behavior.throws {
                    self.schedule(0, Task::Emit(HostCallback::ScriptError));
                }
                let outcome = if behavior.error {
                    SettleOutcome::Errored
                } else {
                    SettleOutcome::Loaded
                };
                self.schedule(0, Task::Settle(node, outcome));
                None
            }
            Task::CompleteFrame { node, generation } => {
                let connected = self.is_connected(node) && !self.held_back(node);
                let src = self.node(node)?.attr("src").unwrap_or_default().to_string();
                let behavior = self.frames.get(&src).cloned().unwrap_or_default();
                let n = self.node_mut(node)?;
                let frame = n.frame.as_mut()?;
                if frame.generation != generation || !connected {
                    return None;
                }
                frame.ready = FrameReadyState::Complete;
                frame.body = behavior.body.map(|[w, h]| Size::new(w, h));
                self.schedule(0, Task::Settle(node, SettleOutcome::Loaded));
                None
            }
        }
    }

    fn frame_behavior(&self, node: NodeId) -> FrameBehavior {
        self.node(node)
            .and_then(|n| n.attr("src"))
            .and_then(|src| self.frames.get(src))
            .cloned()
            .unwrap_or_default()
    }

    /// Serializes `node` with every element tagged by its arena id.
    fn render(&self, id: NodeId, out: &mut String) {
        let Some(n) = self.node(id) else {
            return;
        };
        if n.kind == NodeKind::Text {
            out.push_str(&markup::escape_text(&n.text));
            return;
        }
        out.push('<');
        out.push_str(&n.tag);
        out.push_str(&format!(" {NODE_ID_ATTR}=\"{}\"", id.0));
        for (name, value) in &n.attrs {
            out.push_str(&format!(" {name}=\"{}\"", markup::escape_attr(value)));
        }
        out.push('>');
        if markup::is_void(&n.tag) {
            return;
        }
        if markup::is_raw_text(&n.tag) {
            out.push_str(&n.text);
        } else {
            for child in &n.children {
                self.render(*child, out);
            }
        }
        out.push_str("</");
        out.push_str(&n.tag);
        out.push('>');
    }

    fn attr_px(&self, node: &SimNode, name: &str) -> Option<f64> {
        let raw = node
            .attr(name)
            .or_else(|| node.styles.get(name).map(String::as_str))?;
        raw.trim().trim_end_matches("px").parse::<f64>().ok()
    }
}

impl DomHost for SimDom {
    fn document_body(&self) -> NodeId {
        BODY
    }

    fn create_element(&mut self, tag: &str) -> NodeId {
        self.push_node(SimNode::element(tag))
    }

    fn create_script(&mut self, script: &ScriptDescriptor) -> NodeId {
        let mut node = SimNode::element("script");
        if !script.script_type.is_empty() {
            node.set_attr("type", &script.script_type);
        }
        if let Some(src) = &script.source_url {
            node.set_attr("src", src);
        }
        if script.is_async {
            node.set_attr("async", "");
        }
        if let Some(id) = &script.id {
            node.set_attr("id", id);
        }
        self.push_node(node)
    }

    fn create_inline_script(&mut self, script: &InlineScript) -> NodeId {
        let mut node = SimNode::element("script");
        if !script.script_type.is_empty() {
            node.set_attr("type", &script.script_type);
        }
        if script.is_async {
            node.set_attr("async", "");
        }
        node.text = script.text.clone();
        self.push_node(node)
    }

    fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if parent == child || self.contains(child, parent) {
            warn!(target: "adsidebar.sim", %parent, %child, "refusing to create a cycle");
            return;
        }
        if self.node(parent).is_none() || self.node(child).is_none() {
            return;
        }
        if self.parent(child).is_some() {
            self.remove_from_parent(child);
        }
        if let Some(n) = self.node_mut(child) {
            n.parent = Some(parent);
        }
        if let Some(n) = self.node_mut(parent) {
            n.children.push(child);
        }
        self.record_mutation(parent);
        if self.is_connected(child) {
            self.activate(child);
        }
    }

    /// Moving a held-back node releases it, the same as the blocker letting a
    /// re-issued load through.
    fn remove_from_parent(&mut self, node: NodeId) {
        let Some(parent) = self.parent(node) else {
            return;
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|c| *c != node);
        }
        if let Some(n) = self.node_mut(node) {
            n.parent = None;
            if n.blocked {
                n.blocked = false;
                n.styles.remove("display");
            }
        }
        self.record_mutation(parent);
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node)?.parent
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.node(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn kind(&self, node: NodeId) -> NodeKind {
        self.node(node).map(|n| n.kind).unwrap_or(NodeKind::Element)
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.node(node).map(|n| n.alive).unwrap_or(false)
    }

    fn in_page_document(&self, node: NodeId) -> bool {
        self.is_connected(node)
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.node(id).and_then(|n| n.parent);
        }
        false
    }

    fn query_selector_all(&self, selector: &str) -> Vec<NodeId> {
        let Some(compiled) = markup::compile_selector(selector) else {
            trace!(target: "adsidebar.sim", selector, "invalid selector");
            return Vec::new();
        };
        let mut document = String::from("<!DOCTYPE html><html><head></head>");
        self.render(BODY, &mut document);
        document.push_str("</html>");
        markup::select_ids(&document, &compiled)
            .into_iter()
            .map(NodeId)
            .filter(|node| *node != BODY && self.is_connected(*node))
            .collect()
    }

    fn script_descriptor(&self, node: NodeId) -> Option<ScriptDescriptor> {
        let n = self.node(node)?;
        if n.kind != NodeKind::Script {
            return None;
        }
        Some(ScriptDescriptor {
            script_type: n.attr("type").unwrap_or_default().to_string(),
            source_url: n.attr("src").map(str::to_string),
            is_async: n.attr("async").is_some(),
            id: n.attr("id").map(str::to_string),
        })
    }

    fn rendered_size(&self, node: NodeId) -> Size {
        let Some(n) = self.node(node) else {
            return Size::new(0.0, 0.0);
        };
        if !self.is_connected(node) || !self.is_displayed(node) {
            return Size::new(0.0, 0.0);
        }
        if n.kind == NodeKind::Text {
            let len = n.text.trim().chars().count();
            if len == 0 {
                return Size::indeterminate();
            }
            return Size::new(len as f64 * CHAR_WIDTH_PX, LINE_HEIGHT_PX);
        }

        let width = self.attr_px(n, "width");
        let height = self.attr_px(n, "height");
        if width.is_some() || height.is_some() {
            return Size { width, height };
        }
        match n.kind {
            NodeKind::Frame => return Size::new(300.0, 150.0),
            NodeKind::Image => return Size::new(0.0, 0.0),
            NodeKind::Script => return Size::new(0.0, 0.0),
            _ => {}
        }

        let mut width: Option<f64> = None;
        let mut height: Option<f64> = None;
        for child in &n.children {
            let size = self.rendered_size(*child);
            if let Some(w) = size.width {
                width = Some(width.map_or(w, |cur| cur.max(w)));
            }
            if let Some(h) = size.height {
                height = Some(height.unwrap_or(0.0) + h);
            }
        }
        Size { width, height }
    }

    fn frame_ready_state(&self, frame: NodeId) -> Option<FrameReadyState> {
        if !self.frame_behavior(frame).accessible {
            return None;
        }
        Some(
            self.node(frame)?
                .frame
                .as_ref()
                .map(|f| f.ready)
                .unwrap_or(FrameReadyState::Loading),
        )
    }

    fn frame_body_size(&self, frame: NodeId) -> Option<Size> {
        if !self.frame_behavior(frame).accessible {
            return None;
        }
        self.node(frame)?.frame.as_ref()?.body
    }

    fn visible_text(&self, node: NodeId) -> String {
        let mut out = String::new();
        if !self.is_displayed(node) {
            return out;
        }
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let Some(n) = self.node(current) else {
                continue;
            };
            if n.styles.get("display").map(String::as_str) == Some("none") {
                continue;
            }
            match n.kind {
                NodeKind::Text => {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(n.text.trim());
                }
                NodeKind::Script => {}
                _ => stack.extend(n.children.iter().rev().copied()),
            }
        }
        out
    }

    fn set_style(&mut self, node: NodeId, property: &str, value: &str) {
        let Some(n) = self.node_mut(node) else {
            return;
        };
        let changed = if value.is_empty() {
            n.styles.remove(property).is_some()
        } else {
            n.styles.insert(property.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if changed {
            self.record_mutation(node);
        }
    }

    fn style(&self, node: NodeId, property: &str) -> Option<String> {
        self.node(node)?.styles.get(property).cloned()
    }

    fn set_class_name(&mut self, node: NodeId, class_name: &str) {
        let Some(n) = self.node_mut(node) else {
            return;
        };
        if n.attr("class") == Some(class_name) {
            return;
        }
        n.set_attr("class", class_name);
        self.record_mutation(node);
    }

    fn class_name(&self, node: NodeId) -> String {
        self.node(node)
            .and_then(|n| n.attr("class"))
            .unwrap_or_default()
            .to_string()
    }

    fn observe(&mut self, target: NodeId) -> FeedId {
        let id = FeedId(self.next_handle());
        self.feeds.insert(
            id,
            Feed {
                target,
                pending: 0,
                delivery_queued: false,
            },
        );
        id
    }

    fn take_records(&mut self, feed: FeedId) -> usize {
        self.feeds
            .get_mut(&feed)
            .map(|f| std::mem::take(&mut f.pending))
            .unwrap_or(0)
    }

    fn disconnect(&mut self, feed: FeedId) {
        self.feeds.remove(&feed);
    }

    fn arm_settle(&mut self, node: NodeId) {
        self.armed.insert(node);
    }

    fn disarm_settle(&mut self, node: NodeId) {
        self.armed.remove(&node);
    }

    fn install_write_interception(&mut self) {
        self.write_interception = true;
    }

    fn remove_write_interception(&mut self) {
        self.write_interception = false;
    }

    fn parse_fragment(&mut self, markup: &str) -> Vec<NodeId> {
        self.build_fragment(markup)
    }

    fn set_timer(&mut self, delay_ms: u64) -> TimerId {
        let id = TimerId(self.next_handle());
        self.timers.insert(id);
        self.schedule(delay_ms, Task::Timer(id));
        id
    }

    fn clear_timer(&mut self, timer: TimerId) {
        self.timers.remove(&timer);
    }

    fn inline_scripts(&self) -> Vec<NodeId> {
        self.descendants(BODY)
            .into_iter()
            .filter(|node| {
                self.node(*node)
                    .map(|n| n.kind == NodeKind::Script && n.attr("src").is_none())
                    .unwrap_or(false)
            })
            .collect()
    }

    fn inline_script_source(&self, node: NodeId) -> Option<InlineScript> {
        let n = self.node(node)?;
        if n.kind != NodeKind::Script || n.attr("src").is_some() {
            return None;
        }
        Some(InlineScript {
            script_type: n.attr("type").unwrap_or_default().to_string(),
            is_async: n.attr("async").is_some(),
            text: n.text.clone(),
        })
    }

    fn override_page_ready_hook(&mut self) -> bool {
        if self.page_ready_hook {
            self.ready_hook_overridden = true;
        }
        self.page_ready_hook
    }

    fn has_ad_refresh_api(&self) -> bool {
        self.ad_refresh_api
    }

    fn refresh_third_party_ads(&mut self) -> bool {
        if !self.ad_refresh_api {
            return false;
        }
        self.refresh_calls += 1;
        let frames: Vec<NodeId> = self
            .descendants(BODY)
            .into_iter()
            .filter(|node| self.kind(*node) == NodeKind::Frame)
            .collect();
        for frame in frames {
            let Some(size) = self.frame_behavior(frame).body_after_refresh else {
                continue;
            };
            if let Some(state) = self.node_mut(frame).and_then(|n| n.frame.as_mut()) {
                state.ready = FrameReadyState::Complete;
                state.body = Some(Size::new(size[0], size[1]));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_are_batched_per_feed() {
        let mut dom = SimDom::from_markup(r#"<div id="a"></div><div id="b"></div>"#);
        let a = dom.find("#a").unwrap();
        let b = dom.find("#b").unwrap();
        let feed = dom.observe(a);

        let span = dom.create_element("span");
        dom.append_child(a, span);
        dom.set_style(a, "color", "red");
        dom.set_style(b, "color", "red");

        assert_eq!(dom.next_callback(), Some(HostCallback::Mutations(feed)));
        assert_eq!(dom.next_callback(), None);

        dom.set_style(span, "color", "blue");
        assert_eq!(dom.take_records(feed), 1);
        assert_eq!(dom.next_callback(), None);
    }

    #[test]
    fn only_armed_elements_report_settling() {
        let mut dom = SimDom::new();
        dom.define_script(
            "https://ads.example/tag.js",
            ScriptBehavior {
                load_ms: 50,
                writes: vec!["<p>ad</p>".into()],
                ..ScriptBehavior::default()
            },
        );
        let body = dom.document_body();
        let quiet = dom.create_script(&ScriptDescriptor {
            source_url: Some("https://ads.example/tag.js".into()),
            ..ScriptDescriptor::default()
        });
        dom.append_child(body, quiet);
        assert_eq!(dom.run_until_idle(), 0);

        let armed = dom.create_script(&ScriptDescriptor {
            source_url: Some("https://ads.example/tag.js".into()),
            ..ScriptDescriptor::default()
        });
        dom.arm_settle(armed);
        dom.install_write_interception();
        dom.append_child(body, armed);

        assert_eq!(
            dom.next_callback(),
            Some(HostCallback::DocumentWrite("<p>ad</p>".into()))
        );
        assert_eq!(
            dom.next_callback(),
            Some(HostCallback::Settle(armed, SettleOutcome::Loaded))
        );
        assert_eq!(dom.now(), 100);
    }

    #[test]
    fn blocked_frames_load_only_after_moving() {
        let mut dom = SimDom::new();
        let body = dom.document_body();
        let frames = dom.build_fragment(r#"<iframe src="https://ads.example/f"></iframe>"#);
        let frame = frames[0];
        dom.set_blocked(frame);
        dom.append_child(body, frame);
        dom.run_until_idle();
        assert_eq!(dom.frame_ready_state(frame), Some(FrameReadyState::Loading));
        assert_eq!(dom.rendered_size(frame), Size::new(0.0, 0.0));

        let holder = dom.create_element("div");
        dom.append_child(body, holder);
        dom.append_child(holder, frame);
        dom.run_until_idle();
        assert_eq!(dom.frame_ready_state(frame), Some(FrameReadyState::Complete));
        assert_eq!(dom.frame_body_size(frame), Some(Size::new(300.0, 250.0)));
    }

    #[test]
    fn auto_sized_elements_stack_their_children() {
        let dom = SimDom::from_markup(
            r#"<div id="ad"><img width="300" height="250"><p>Sponsored</p></div><div id="empty"></div>"#,
        );
        let ad = dom.find("#ad").unwrap();
        let empty = dom.find("#empty").unwrap();
        assert_eq!(dom.rendered_size(ad), Size::new(300.0, 266.0));
        assert!(dom.rendered_size(empty).is_indeterminate());
        assert_eq!(dom.visible_text(ad), "Sponsored");
    }

    #[test]
    fn selector_queries_follow_css_matching() {
        let mut dom = SimDom::from_markup(
            r#"<div id="top" class="ad banner"><section><iframe id="google_ads_iframe_1"></iframe></section></div><p>5 &lt; 6</p>"#,
        );
        let top = dom.find("#top").unwrap();
        let frame = dom.find("iframe").unwrap();

        assert_eq!(dom.query_selector_all("div.ad.banner#top"), vec![top]);
        assert!(dom.query_selector_all("div.ad.sidebar").is_empty());
        assert_eq!(dom.query_selector_all(r#"iframe[id^="google_ads"]"#), vec![frame]);
        assert_eq!(dom.query_selector_all(".ad > section > iframe"), vec![frame]);
        assert!(dom.query_selector_all(".ad > iframe").is_empty());
        let paragraph = dom.find("body p").unwrap();
        assert_eq!(dom.visible_text(paragraph), "5 < 6");
        assert!(dom.query_selector_all("[id=x").is_empty());

        let detached = dom.build_fragment(r#"<div class="ad"></div>"#)[0];
        assert!(!dom.query_selector_all(".ad").contains(&detached));
        dom.append_child(top, detached);
        assert_eq!(dom.query_selector_all(".ad"), vec![top, detached]);
    }
}
