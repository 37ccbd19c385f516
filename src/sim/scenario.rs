//! YAML scenarios: a page, the behaviour of its third-party resources and a
//! timeline of host events, replayed against [`SimDom`] and the controller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use adsidebar_core_types::{FilterKind, Hit, NodeId, PageViewId, PolicyDecision, Verdict};
use adsidebar_event_bus::InMemoryBus;
use adsidebar_policy_center::InMemoryPolicyCenter;

use crate::container::CONTAINER_CLASS;
use crate::controller::AdSidebar;
use crate::errors::EngineError;
use crate::events::SidebarEvent;
use crate::host::DomHost;
use crate::model::SessionStats;

use super::dom::{FrameBehavior, HostCallback, ScriptBehavior, SimDom};

/// Virtual time allowed after the last step for everything to settle.
const DEFAULT_SETTLE_MS: u64 = 60_000;
const MAX_CALLBACKS: usize = 100_000;
const EVENT_CAPACITY: usize = 4_096;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown filter kind in step {step}: {source}")]
    FilterKind {
        step: usize,
        #[source]
        source: adsidebar_core_types::SidebarError,
    },
    #[error("step {step}: no element matches {selector}")]
    TargetNotFound { step: usize, selector: String },
    #[error("step {step}: markup did not parse")]
    Markup { step: usize },
    #[error("scenario did not settle after {0} callbacks")]
    Runaway(usize),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn default_location() -> String {
    "https://www.example.com/".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_true")]
    pub top_level: bool,
    /// Initial body markup.
    #[serde(default)]
    pub page: String,
    #[serde(default)]
    pub ad_refresh_api: bool,
    #[serde(default)]
    pub page_ready_hook: bool,
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptBehavior>,
    #[serde(default)]
    pub frames: BTreeMap<String, FrameBehavior>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub settle_ms: Option<u64>,
}

impl Scenario {
    pub fn from_yaml_str(source: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&source)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Inserts `markup` (or targets existing `selector` matches) and asks the
    /// controller about each element as the content blocker would.
    Block {
        #[serde(default)]
        markup: Option<String>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        into: Option<String>,
        #[serde(default)]
        hits: Vec<HitSpec>,
    },
    /// Page content the blocker does not care about.
    Insert {
        markup: String,
        #[serde(default)]
        into: Option<String>,
    },
    WindowLoad,
    Destroy {
        selector: String,
    },
    PointerEnter,
    PointerLeave,
    Toggle,
    Expand,
    Collapse,
    ScriptError,
    Close,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HitSpec {
    pub kind: String,
    pub filter: String,
}

impl HitSpec {
    fn to_hit(&self, step: usize) -> Result<Hit, ScenarioError> {
        let kind: FilterKind = self
            .kind
            .parse()
            .map_err(|source| ScenarioError::FilterKind { step, source })?;
        Ok(Hit::new(kind, self.filter.clone()))
    }
}

/// One box of the relocation container, in container order.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BoxReport {
    pub content: String,
    pub hidden: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub elapsed_ms: u64,
    pub stats: Option<SessionStats>,
    pub boxes: Vec<BoxReport>,
    pub events: Vec<SidebarEvent>,
    pub host_refresh_calls: u32,
    pub inline_script_runs: u32,
    pub ready_hook_overridden: bool,
    pub dropped_writes: u32,
    pub warnings: Vec<String>,
}

impl ScenarioReport {
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(SidebarEvent::name).collect()
    }

    pub fn count_events(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name() == name).count()
    }
}

pub struct ScenarioRunner {
    sidebar: AdSidebar,
    dom: SimDom,
    page: Option<PageViewId>,
    last_stats: Option<SessionStats>,
    warnings: Vec<String>,
    callbacks: usize,
}

impl ScenarioRunner {
    pub fn new(policy: Arc<InMemoryPolicyCenter>) -> Self {
        Self {
            sidebar: AdSidebar::with_bus(policy, InMemoryBus::new(EVENT_CAPACITY)),
            dom: SimDom::new(),
            page: None,
            last_stats: None,
            warnings: Vec::new(),
            callbacks: 0,
        }
    }

    pub fn dom(&self) -> &SimDom {
        &self.dom
    }

    pub fn sidebar(&self) -> &AdSidebar {
        &self.sidebar
    }

    pub fn run(mut self, scenario: &Scenario) -> Result<ScenarioReport, ScenarioError> {
        let mut events = self.sidebar.subscribe();

        self.dom.set_ad_refresh_api(scenario.ad_refresh_api);
        self.dom.set_page_ready_hook(scenario.page_ready_hook);
        for (src, behavior) in &scenario.scripts {
            self.dom.define_script(src.clone(), behavior.clone());
        }
        for (src, behavior) in &scenario.frames {
            self.dom.define_frame(src.clone(), behavior.clone());
        }
        if !scenario.page.trim().is_empty() {
            let body = self.dom.document_body();
            if self.dom.append_markup(body, &scenario.page).is_empty() {
                return Err(ScenarioError::Markup { step: 0 });
            }
        }
        self.page = self
            .sidebar
            .open_page(&scenario.location, scenario.top_level)?;
        info!(
            target: "adsidebar.sim",
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "scenario started"
        );

        let mut steps: Vec<(usize, &Step)> = scenario.steps.iter().enumerate().collect();
        steps.sort_by_key(|(_, step)| step.at_ms);
        let mut last_at = 0;
        for (index, step) in steps {
            self.pump_until(step.at_ms)?;
            self.apply(index, &step.action)?;
            last_at = step.at_ms;
        }
        let horizon = last_at.saturating_add(scenario.settle_ms.unwrap_or(DEFAULT_SETTLE_MS));
        self.pump_until(horizon)?;

        let stats = match &self.page {
            Some(page) => self.sidebar.stats(page).ok().or(self.last_stats.take()),
            None => self.last_stats.take(),
        };
        let mut collected = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => collected.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    self.warnings.push(format!("{skipped} events lost"));
                }
                Err(_) => break,
            }
        }

        Ok(ScenarioReport {
            name: scenario.name.clone(),
            elapsed_ms: self.dom.now(),
            stats,
            boxes: self.boxes(),
            events: collected,
            host_refresh_calls: self.dom.refresh_calls(),
            inline_script_runs: self.dom.inline_runs(),
            ready_hook_overridden: self.dom.ready_hook_overridden(),
            dropped_writes: self.dom.dropped_writes(),
            warnings: self.warnings,
        })
    }

    fn pump_until(&mut self, deadline: u64) -> Result<(), ScenarioError> {
        while let Some(callback) = self.dom.next_callback_until(deadline) {
            self.callbacks += 1;
            if self.callbacks > MAX_CALLBACKS {
                return Err(ScenarioError::Runaway(self.callbacks));
            }
            self.dispatch(callback);
        }
        self.dom.advance_to(deadline);
        Ok(())
    }

    fn dispatch(&mut self, callback: HostCallback) {
        let Some(page) = self.page.clone() else {
            return;
        };
        let dom = &mut self.dom;
        match callback {
            HostCallback::Timer(timer) => self.sidebar.on_timer(&page, dom, timer),
            HostCallback::Settle(node, outcome) => {
                self.sidebar.on_element_settled(&page, dom, node, outcome)
            }
            HostCallback::Mutations(feed) => self.sidebar.on_mutations(&page, dom, feed),
            HostCallback::DocumentWrite(markup) => {
                self.sidebar.on_document_write(&page, dom, &markup)
            }
            HostCallback::ScriptError => self.sidebar.on_script_error(&page),
        }
    }

    fn resolve_target(&self, step: usize, into: &Option<String>) -> Result<NodeId, ScenarioError> {
        match into {
            None => Ok(self.dom.document_body()),
            Some(selector) => {
                self.dom
                    .find(selector)
                    .ok_or_else(|| ScenarioError::TargetNotFound {
                        step,
                        selector: selector.clone(),
                    })
            }
        }
    }

    fn apply(&mut self, step: usize, action: &Action) -> Result<(), ScenarioError> {
        debug!(target: "adsidebar.sim", step, at = self.dom.now(), ?action, "applying step");
        match action {
            Action::Block {
                markup,
                selector,
                into,
                hits,
            } => {
                let hits = hits
                    .iter()
                    .map(|spec| spec.to_hit(step))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut targets = Vec::new();
                if let Some(markup) = markup {
                    let parent = self.resolve_target(step, into)?;
                    let nodes = self.dom.append_markup(parent, markup);
                    if nodes.is_empty() {
                        return Err(ScenarioError::Markup { step });
                    }
                    targets.extend(
                        nodes
                            .into_iter()
                            .filter(|node| self.dom.tag(*node) != Some("#text")),
                    );
                }
                if let Some(selector) = selector {
                    targets.extend(self.dom.query_selector_all(selector));
                }
                let decision = PolicyDecision::block(hits);
                for node in targets {
                    if self.decide(node, &decision) == Verdict::Block {
                        self.dom.set_blocked(node);
                    }
                }
            }
            Action::Insert { markup, into } => {
                let parent = self.resolve_target(step, into)?;
                if self.dom.append_markup(parent, markup).is_empty() {
                    return Err(ScenarioError::Markup { step });
                }
            }
            Action::WindowLoad => {
                if let Some(page) = self.page.clone() {
                    self.sidebar.on_window_load(&page, &mut self.dom);
                }
            }
            Action::Destroy { selector } => {
                let nodes = self.dom.query_selector_all(selector);
                if nodes.is_empty() {
                    warn!(target: "adsidebar.sim", step, selector, "nothing to destroy");
                }
                for node in nodes {
                    self.dom.destroy(node);
                }
            }
            Action::PointerEnter => {
                if let Some(page) = self.page.clone() {
                    self.sidebar.on_pointer_enter(&page, &mut self.dom);
                }
            }
            Action::PointerLeave => {
                if let Some(page) = self.page.clone() {
                    self.sidebar.on_pointer_leave(&page, &mut self.dom);
                }
            }
            Action::Toggle => self.chrome(step, |sidebar, page, dom| sidebar.toggle(page, dom)),
            Action::Expand => self.chrome(step, |sidebar, page, dom| {
                sidebar.set_expanded(page, dom, true)
            }),
            Action::Collapse => self.chrome(step, |sidebar, page, dom| {
                sidebar.set_expanded(page, dom, false)
            }),
            Action::ScriptError => {
                if let Some(page) = self.page.clone() {
                    self.sidebar.on_script_error(&page);
                }
            }
            Action::Close => {
                if let Some(page) = self.page.take() {
                    self.last_stats = self.sidebar.stats(&page).ok();
                    self.sidebar.close_page(&page, &mut self.dom);
                }
            }
        }
        Ok(())
    }

    fn decide(&mut self, node: NodeId, decision: &PolicyDecision) -> Verdict {
        match self.page.clone() {
            Some(page) => self
                .sidebar
                .on_policy_decision(&page, &mut self.dom, node, decision),
            None => Verdict::Block,
        }
    }

    /// Chrome operations that fail are recorded as warnings, not errors.
    fn chrome(
        &mut self,
        step: usize,
        op: impl FnOnce(&AdSidebar, &PageViewId, &mut SimDom) -> Result<(), EngineError>,
    ) {
        let Some(page) = self.page.clone() else {
            self.warnings.push(format!("step {step}: no page view"));
            return;
        };
        if let Err(err) = op(&self.sidebar, &page, &mut self.dom) {
            warn!(target: "adsidebar.sim", step, %err, "chrome operation failed");
            self.warnings.push(format!("step {step}: {err}"));
        }
    }

    fn boxes(&self) -> Vec<BoxReport> {
        let selector = format!(".{CONTAINER_CLASS}");
        let Some(root) = self.dom.find(&selector) else {
            return Vec::new();
        };
        self.dom
            .children(root)
            .into_iter()
            .map(|wrapper| BoxReport {
                content: self
                    .dom
                    .first_child(wrapper)
                    .map(|node| self.describe(node))
                    .unwrap_or_default(),
                hidden: self.dom.style(wrapper, "display").as_deref() == Some("none"),
            })
            .collect()
    }

    /// `tag#id.class` of the first element under `node`, the wrapper div a
    /// replayed script sits in included.
    fn describe(&self, node: NodeId) -> String {
        let mut out = self.dom.tag(node).unwrap_or_default().to_string();
        if let Some(id) = self.dom.attribute(node, "id") {
            out.push('#');
            out.push_str(id);
        }
        if let Some(class) = self.dom.attribute(node, "class") {
            for c in class.split_whitespace() {
                out.push('.');
                out.push_str(c);
            }
        }
        if out == "div" {
            if let Some(src) = self
                .dom
                .first_child(node)
                .and_then(|child| self.dom.attribute(child, "src"))
            {
                out = format!("script[src={src}]");
            }
        }
        out
    }
}

/// Loads and runs one scenario against a fresh controller.
pub fn run_scenario(
    scenario: &Scenario,
    policy: Arc<InMemoryPolicyCenter>,
) -> Result<ScenarioReport, ScenarioError> {
    ScenarioRunner::new(policy).run(scenario)
}
