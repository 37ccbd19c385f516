//! Everything the engine needs from a live document.
//!
//! Implementations queue their own callbacks (settle signals, timer expiry,
//! mutation batches, intercepted writes) and deliver them from their event
//! loop. No method of this trait may call back into the controller.

use adsidebar_core_types::{FeedId, NodeId, TimerId};

use crate::model::{InlineScript, ScriptDescriptor};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Element,
    Frame,
    Image,
    Script,
    Text,
}

impl NodeKind {
    pub fn is_frame_like(&self) -> bool {
        matches!(self, NodeKind::Frame)
    }

    pub fn is_media(&self) -> bool {
        matches!(self, NodeKind::Frame | NodeKind::Image)
    }
}

/// Ready state of a frame's inner document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameReadyState {
    Loading,
    Interactive,
    Complete,
}

/// Terminal signal of an armed element. Both variants advance the replay queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SettleOutcome {
    Loaded,
    Errored,
}

/// Rendered size in CSS pixels. `None` is an indeterminate (auto) side.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Size {
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
        }
    }

    pub fn indeterminate() -> Self {
        Self::default()
    }

    pub fn is_indeterminate(&self) -> bool {
        self.width.is_none() && self.height.is_none()
    }

    /// True when a known side is at or below `limit`.
    pub fn has_side_at_most(&self, limit: f64) -> bool {
        self.width.map(|w| w <= limit).unwrap_or(false)
            || self.height.map(|h| h <= limit).unwrap_or(false)
    }

    /// True when a known side is strictly above `limit`.
    pub fn has_side_above(&self, limit: f64) -> bool {
        self.width.map(|w| w > limit).unwrap_or(false)
            || self.height.map(|h| h > limit).unwrap_or(false)
    }
}

pub trait DomHost {
    /// Body of the top-level document; the sidebar is attached here.
    fn document_body(&self) -> NodeId;

    fn create_element(&mut self, tag: &str) -> NodeId;
    /// Fresh script element built from a captured descriptor. It executes
    /// once connected.
    fn create_script(&mut self, script: &ScriptDescriptor) -> NodeId;
    fn create_inline_script(&mut self, script: &InlineScript) -> NodeId;

    fn append_child(&mut self, parent: NodeId, child: NodeId);
    fn remove_from_parent(&mut self, node: NodeId);
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn children(&self, node: NodeId) -> Vec<NodeId>;
    fn kind(&self, node: NodeId) -> NodeKind;

    /// False once the handle no longer refers to a usable node.
    fn is_alive(&self, node: NodeId) -> bool;
    /// True when the node belongs to the top-level document.
    fn in_page_document(&self, node: NodeId) -> bool;
    /// Inclusive containment.
    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool;
    /// Matches in document order.
    fn query_selector_all(&self, selector: &str) -> Vec<NodeId>;
    fn script_descriptor(&self, node: NodeId) -> Option<ScriptDescriptor>;

    fn rendered_size(&self, node: NodeId) -> Size;
    /// `None` when the frame document is not accessible.
    fn frame_ready_state(&self, frame: NodeId) -> Option<FrameReadyState>;
    /// `None` when the frame has no accessible body.
    fn frame_body_size(&self, frame: NodeId) -> Option<Size>;
    fn visible_text(&self, node: NodeId) -> String;

    /// An empty value removes the property.
    fn set_style(&mut self, node: NodeId, property: &str, value: &str);
    fn style(&self, node: NodeId, property: &str) -> Option<String>;
    fn set_class_name(&mut self, node: NodeId, class_name: &str);
    fn class_name(&self, node: NodeId) -> String;

    /// Subtree feed over attributes, character data and child lists.
    fn observe(&mut self, target: NodeId) -> FeedId;
    /// Drains records not yet delivered; returns how many there were.
    fn take_records(&mut self, feed: FeedId) -> usize;
    fn disconnect(&mut self, feed: FeedId);

    fn arm_settle(&mut self, node: NodeId);
    fn disarm_settle(&mut self, node: NodeId);

    /// While installed, page writes are delivered as `on_document_write`.
    fn install_write_interception(&mut self);
    fn remove_write_interception(&mut self);
    /// Parses markup into detached nodes. Incomplete markup yields none.
    fn parse_fragment(&mut self, markup: &str) -> Vec<NodeId>;

    fn set_timer(&mut self, delay_ms: u64) -> TimerId;
    fn clear_timer(&mut self, timer: TimerId);

    /// Script elements of the page without a source URL.
    fn inline_scripts(&self) -> Vec<NodeId>;
    fn inline_script_source(&self, node: NodeId) -> Option<InlineScript>;
    /// Replaces the page's deferred ready hook with immediate invocation.
    /// Returns false when the page has no such hook.
    fn override_page_ready_hook(&mut self) -> bool;
    fn has_ad_refresh_api(&self) -> bool;
    fn refresh_third_party_ads(&mut self) -> bool;

    fn first_child(&self, node: NodeId) -> Option<NodeId> {
        self.children(node).into_iter().next()
    }

    /// Strict descendants of `root` in document order.
    fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(root).into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).into_iter().rev());
        }
        out
    }

    fn descendants_of_kind(&self, root: NodeId, kind: NodeKind) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|node| self.kind(*node) == kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_threshold_checks_ignore_unknown_sides() {
        let half_known = Size {
            width: None,
            height: Some(250.0),
        };
        assert!(!half_known.has_side_at_most(15.0));
        assert!(half_known.has_side_above(15.0));

        let thin = Size::new(300.0, 10.0);
        assert!(thin.has_side_at_most(15.0));

        assert!(Size::indeterminate().is_indeterminate());
        assert!(!Size::indeterminate().has_side_above(0.0));
    }
}
