//! Markup handling for the simulated host, on top of `scraper`.
//!
//! Fragments go through the HTML5 parser in a body context, the same way a
//! contextual fragment parse does in a browser. Input that ends inside a tag
//! drops that tag, so a write split in the middle of a start tag yields no
//! nodes until the rest arrives.
//!
//! Selector queries serialize the arena into a document tagged with node ids,
//! reparse it and map the matches back.

use scraper::{ElementRef, Html, Selector};

/// Carries the arena id through serialization.
pub(crate) const NODE_ID_ATTR: &str = "data-sim-node";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ParsedNode {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        /// Raw text of script and style elements.
        text: String,
        children: Vec<ParsedNode>,
    },
    Text(String),
}

pub(crate) fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

pub(crate) fn is_raw_text(tag: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&tag)
}

/// Top-level nodes of `markup`. Whitespace-only text is dropped.
pub(crate) fn parse_fragment(markup: &str) -> Vec<ParsedNode> {
    let fragment = Html::parse_fragment(markup);
    convert_children(fragment.root_element())
}

fn convert_children(parent: ElementRef<'_>) -> Vec<ParsedNode> {
    let mut out = Vec::new();
    for child in parent.children() {
        if let Some(element) = ElementRef::wrap(child) {
            out.push(convert_element(element));
        } else if let Some(text) = child.value().as_text() {
            let content: &str = text;
            if !content.trim().is_empty() {
                out.push(ParsedNode::Text(content.to_string()));
            }
        }
    }
    out
}

fn convert_element(element: ElementRef<'_>) -> ParsedNode {
    let value = element.value();
    let tag = value.name().to_ascii_lowercase();
    let attrs = value
        .attrs()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    if is_raw_text(&tag) {
        return ParsedNode::Element {
            text: element.text().collect(),
            tag,
            attrs,
            children: Vec::new(),
        };
    }
    ParsedNode::Element {
        children: convert_children(element),
        tag,
        attrs,
        text: String::new(),
    }
}

/// `None` when `selector` is not valid CSS.
pub(crate) fn compile_selector(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

/// Ids of the elements of `document` matching `selector`, in document order.
pub(crate) fn select_ids(document: &str, selector: &Selector) -> Vec<u64> {
    let html = Html::parse_document(document);
    html.select(selector)
        .filter_map(|element| element.value().attr(NODE_ID_ATTR)?.parse().ok())
        .collect()
}

pub(crate) fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(nodes: &[ParsedNode]) -> Vec<&str> {
        nodes
            .iter()
            .map(|node| match node {
                ParsedNode::Element { tag, .. } => tag.as_str(),
                ParsedNode::Text(_) => "#text",
            })
            .collect()
    }

    #[test]
    fn nested_markup_with_void_and_raw_text_elements() {
        let nodes = parse_fragment(
            r#"<div class="ad" data-x='1'><img src="a.png" width=300><script>if (a < b) {}</script></div> tail"#,
        );
        assert_eq!(tags(&nodes), vec!["div", "#text"]);
        let ParsedNode::Element { attrs, children, .. } = &nodes[0] else {
            panic!("expected element");
        };
        assert!(attrs.contains(&("data-x".to_string(), "1".to_string())));
        assert_eq!(tags(children), vec!["img", "script"]);
        assert!(matches!(
            &children[1],
            ParsedNode::Element { text, .. } if text == "if (a < b) {}"
        ));
        assert_eq!(nodes[1], ParsedNode::Text(" tail".into()));
    }

    #[test]
    fn writes_ending_inside_a_start_tag_yield_nothing() {
        assert!(parse_fragment(r#"<div class="written""#).is_empty());
        assert!(parse_fragment("   \n ").is_empty());
        assert_eq!(
            tags(&parse_fragment(
                r#"<div class="written"><img width="300" height="250"></div>"#
            )),
            vec!["div"]
        );
    }

    #[test]
    fn unbalanced_markup_is_repaired_like_a_browser() {
        assert_eq!(tags(&parse_fragment("<p>promo")), vec!["p"]);
        assert_eq!(
            parse_fragment("a < b"),
            vec![ParsedNode::Text("a < b".into())]
        );
        assert_eq!(tags(&parse_fragment("<div></span>x</div>")), vec!["div"]);
    }

    #[test]
    fn selection_maps_tagged_elements_back() {
        let document = r#"<html><head></head><body data-sim-node="0"><div data-sim-node="4" class="ad"><span data-sim-node="9" class="ad"></span></div></body></html>"#;
        let selector = compile_selector(".ad").unwrap();
        assert_eq!(select_ids(document, &selector), vec![4, 9]);
        assert!(compile_selector("[id=x").is_none());
    }
}
