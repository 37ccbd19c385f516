//! The relocation container: the subtree inside the sidebar that receives
//! relocated content, one private wrapper box per element.

use adsidebar_core_types::NodeId;
use adsidebar_policy_center::LayoutPolicy;

use crate::host::{DomHost, NodeKind};
use crate::model::AdEntry;

/// Marks boxes that were styled as ads. Anything else is hidden on completion.
pub const AD_BOX_CLASS: &str = "adsidebar_ad_div";
pub const CONTAINER_CLASS: &str = "adsidebar_ad_container";

#[derive(Debug)]
pub struct RelocationContainer {
    root: NodeId,
    box_width: f64,
    box_height: f64,
    entries: Vec<AdEntry>,
    last_visible_box: Option<NodeId>,
    relocated: usize,
}

impl RelocationContainer {
    pub fn create(host: &mut dyn DomHost, parent: NodeId, layout: &LayoutPolicy) -> Self {
        let box_width = f64::from(layout.box_width);
        let box_height = f64::from(layout.box_height);
        let root = host.create_element("div");
        host.set_class_name(root, CONTAINER_CLASS);
        host.set_style(root, "overflow", "auto");
        host.set_style(
            root,
            "height",
            &px(box_height * f64::from(layout.visible_boxes)),
        );
        host.append_child(parent, root);
        Self {
            root,
            box_width,
            box_height,
            entries: Vec::new(),
            last_visible_box: None,
            relocated: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn entries(&self) -> &[AdEntry] {
        &self.entries
    }

    pub fn last_visible_box(&self) -> Option<NodeId> {
        self.last_visible_box
    }

    pub fn relocated_count(&self) -> usize {
        self.relocated
    }

    /// Wraps `node` in a new box at the end of the container, detaching it
    /// from its original parent first.
    pub fn insert(&mut self, host: &mut dyn DomHost, node: NodeId) -> NodeId {
        let wrapper = host.create_element("div");
        host.append_child(self.root, wrapper);
        if host.parent(node).is_some() {
            host.remove_from_parent(node);
        }
        host.append_child(wrapper, node);
        self.relocated += 1;
        wrapper
    }

    /// Rebuilds the entry list from the live subtree. Reads only.
    pub fn scan(&mut self, host: &dyn DomHost, min_visible_px: f64) -> usize {
        self.entries.clear();
        for wrapper in host.children(self.root) {
            let Some(content) = host.first_child(wrapper) else {
                continue;
            };
            if host.children(content).is_empty() && !host.kind(content).is_media() {
                continue;
            }
            let size = host.rendered_size(content);
            if size.is_indeterminate() || size.has_side_at_most(min_visible_px) {
                continue;
            }
            self.entries.push(AdEntry {
                wrapper_box: wrapper,
                content_element: content,
                original_width: size.width.unwrap_or(self.box_width),
                original_height: size.height.unwrap_or(self.box_height),
            });
        }
        self.entries.len()
    }

    /// Candidate boxes whose content did not load.
    pub fn empty_boxes(&self, host: &dyn DomHost, min_visible_px: f64) -> Vec<NodeId> {
        self.entries
            .iter()
            .map(|entry| entry.wrapper_box)
            .filter(|wrapper| is_empty_box(host, *wrapper, min_visible_px))
            .collect()
    }

    /// Relocated frames often carry absolute positioning from their old slot.
    pub fn strip_frame_positioning(&self, host: &mut dyn DomHost) {
        for frame in host.descendants_of_kind(self.root, NodeKind::Frame) {
            host.set_style(frame, "position", "");
        }
    }

    pub fn apply_styles(
        &self,
        host: &mut dyn DomHost,
        layout: &LayoutPolicy,
        expanded: bool,
        scaling_enabled: bool,
    ) {
        let max_width = f64::from(layout.max_width);
        let max_height = f64::from(layout.max_height);

        host.set_style(self.root, "overflow", "auto");
        if expanded {
            host.set_style(self.root, "width", &px(max_width));
            host.set_style(self.root, "height", &px(max_height));
        } else {
            host.set_style(self.root, "width", &px(self.box_width));
            host.set_style(
                self.root,
                "height",
                &px(self.box_height * f64::from(layout.visible_boxes)),
            );
        }

        let scale = layout.scale_factor;
        for entry in &self.entries {
            let wrapper = entry.wrapper_box;
            let content = entry.content_element;

            host.set_class_name(wrapper, AD_BOX_CLASS);
            host.set_style(wrapper, "border", "solid black");
            host.set_style(wrapper, "overflow", "hidden");
            host.set_style(wrapper, "visibility", "visible");
            if expanded {
                host.set_style(wrapper, "width", &px(max_width));
                host.set_style(wrapper, "height", &px(entry.original_height));
            } else {
                host.set_style(wrapper, "width", &px(self.box_width));
                host.set_style(wrapper, "height", &px(self.box_height));
            }

            host.set_style(content, "transform", "");
            host.set_style(content, "float", "left");

            let size = host.rendered_size(content);
            let width = size.width.unwrap_or(entry.original_width);
            let height = size.height.unwrap_or(entry.original_height);

            let scaled = scaling_enabled
                && !expanded
                && (width > self.box_width || height > self.box_height);
            if scaled {
                let (tx, ty) = if scale < 1.0 {
                    (
                        (-(width - width * scale) / 2.0).floor(),
                        (-(height - height * scale) / 2.0).floor(),
                    )
                } else {
                    (0.0, 0.0)
                };
                host.set_style(
                    content,
                    "transform",
                    &format!("translate({tx}px, {ty}px) scale({scale}, {scale})"),
                );
            }

            if expanded {
                host.set_style(wrapper, "height", &px(height));
            } else {
                let reduced = if scaled { height * scale } else { height };
                if reduced < self.box_height {
                    host.set_style(wrapper, "height", &px(reduced));
                }
            }
        }
    }

    pub fn hide_non_candidates(&self, host: &mut dyn DomHost) {
        for child in host.children(self.root) {
            if host.class_name(child) != AD_BOX_CLASS {
                host.set_style(child, "display", "none");
            }
        }
    }

    pub fn hide_boxes(&self, host: &mut dyn DomHost, boxes: &[NodeId]) {
        for wrapper in boxes {
            host.set_style(*wrapper, "display", "none");
        }
    }

    /// Recomputes the last visible ad box and returns the previous one.
    pub fn refresh_last_visible_box(&mut self, host: &dyn DomHost) -> Option<NodeId> {
        let last = host
            .children(self.root)
            .into_iter()
            .filter(|child| {
                host.class_name(*child) == AD_BOX_CLASS
                    && host.style(*child, "display").as_deref() != Some("none")
            })
            .last();
        std::mem::replace(&mut self.last_visible_box, last)
    }
}

/// A box is empty when its frames never rendered a visible body, or when it has
/// neither frames nor images and no visible text.
pub fn is_empty_box(host: &dyn DomHost, wrapper: NodeId, min_visible_px: f64) -> bool {
    let descendants = host.descendants(wrapper);
    let frames: Vec<NodeId> = descendants
        .iter()
        .copied()
        .filter(|node| host.kind(*node).is_frame_like())
        .collect();
    if !frames.is_empty() {
        return !frames.iter().any(|frame| {
            host.frame_body_size(*frame)
                .map(|size| size.has_side_above(min_visible_px))
                .unwrap_or(false)
        });
    }
    let has_image = descendants
        .iter()
        .any(|node| host.kind(*node) == NodeKind::Image);
    !has_image && host.visible_text(wrapper).trim().is_empty()
}

pub(crate) fn px(value: f64) -> String {
    format!("{value}px")
}
