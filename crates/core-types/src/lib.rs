use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Shared error type for the AdSidebar crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SidebarError {
    #[error("{message}")]
    Message { message: String },
}

impl SidebarError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Identity of one top-level page view. A navigation produces a new id.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageViewId(pub String);

impl PageViewId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for PageViewId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to a host element. Never dereferenced by the engine itself.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(pub u64);

#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FeedId(pub u64);

/// Per page view lifecycle. Variants are declared in their forward order.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(rename_all = "snake_case"))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Init,
    WindowLoaded,
    ReplayStarted,
    ReplayComplete,
    AdMonitorStarted,
    AdMonitorComplete,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::WindowLoaded => "window_loaded",
            Phase::ReplayStarted => "replay_started",
            Phase::ReplayComplete => "replay_complete",
            Phase::AdMonitorStarted => "ad_monitor_started",
            Phase::AdMonitorComplete => "ad_monitor_complete",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of filter rule that produced a hit.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(rename_all = "snake_case"))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FilterKind {
    /// Request blocking rule.
    Blocking,
    /// Element hiding rule (`domain##selector`).
    ElemHide,
    Other(String),
}

impl FromStr for FilterKind {
    type Err = SidebarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => Err(SidebarError::new("empty filter kind")),
            "blocking" => Ok(FilterKind::Blocking),
            "elemhide" | "elem_hide" => Ok(FilterKind::ElemHide),
            other => Ok(FilterKind::Other(other.to_string())),
        }
    }
}

/// Why an element or selector was matched by the policy.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Hit {
    pub filter_kind: FilterKind,
    pub filter_text: String,
}

impl Hit {
    pub fn new(filter_kind: FilterKind, filter_text: impl Into<String>) -> Self {
        Self {
            filter_kind,
            filter_text: filter_text.into(),
        }
    }

    pub fn elem_hide(filter_text: impl Into<String>) -> Self {
        Self::new(FilterKind::ElemHide, filter_text)
    }

    pub fn blocking(filter_text: impl Into<String>) -> Self {
        Self::new(FilterKind::Blocking, filter_text)
    }

    pub fn is_elem_hide(&self) -> bool {
        self.filter_kind == FilterKind::ElemHide
    }

    /// CSS selector of an element hiding rule: everything after the first `##`.
    pub fn selector(&self) -> Option<&str> {
        if !self.is_elem_hide() {
            return None;
        }
        let selector = match self.filter_text.find("##") {
            Some(idx) => &self.filter_text[idx + 2..],
            None => self.filter_text.as_str(),
        };
        let selector = selector.trim();
        if selector.is_empty() {
            None
        } else {
            Some(selector)
        }
    }
}

/// Answer of the external policy service for one candidate element.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PolicyDecision {
    pub blocked: bool,
    pub hits: Vec<Hit>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(hits: Vec<Hit>) -> Self {
        Self {
            blocked: true,
            hits,
        }
    }
}

/// What the caller must do with the candidate element.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Allow,
    Block,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}
