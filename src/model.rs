use serde::{Deserialize, Serialize};

use adsidebar_core_types::{NodeId, PageViewId, Phase};

/// Script attributes captured by value when a script is blocked. The original
/// element may be discarded by the page, and a fresh element is needed anyway
/// for the script to execute again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    #[serde(default)]
    pub script_type: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub id: Option<String>,
}

/// Source of a script element without a URL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineScript {
    pub script_type: String,
    pub is_async: bool,
    pub text: String,
}

impl InlineScript {
    /// Empty script used as a completion marker after written content.
    pub fn sentinel() -> Self {
        Self::default()
    }
}

/// Element captured before the page finished loading, replayed afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingItem {
    PlainElement(NodeId),
    FrameElement(NodeId),
    Script(ScriptDescriptor),
}

impl PendingItem {
    pub fn label(&self) -> &'static str {
        match self {
            PendingItem::PlainElement(_) => "element",
            PendingItem::FrameElement(_) => "frame",
            PendingItem::Script(_) => "script",
        }
    }
}

/// One candidate ad found by a container scan.
#[derive(Clone, Debug, PartialEq)]
pub struct AdEntry {
    pub wrapper_box: NodeId,
    pub content_element: NodeId,
    pub original_width: f64,
    pub original_height: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdLoadStats {
    pub non_empty_box_count: usize,
    pub empty_box_count: usize,
    pub hidden_element_count: usize,
    /// Session maximum, never decreases.
    pub confirmed_ad_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub replayed_count: usize,
    pub dead_item_count: usize,
    pub doc_write_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub page_view: PageViewId,
    pub location: String,
    pub phase: Phase,
    pub enabled_ad_count: usize,
    pub displayed: bool,
    pub expanded: bool,
    pub queued_items: usize,
    pub hit_count: usize,
    pub relocated_count: usize,
    pub monitor_rounds: u32,
    pub refresh_calls: u32,
    pub script_error: bool,
    pub remediated: bool,
    pub ads: AdLoadStats,
    pub replay: ReplayStats,
}
