//! Mutable HTML tree built on kuchikikiki.
//!
//! kuchikikiki drives html5ever's standards-compliant tree builder, so
//! malformed markup always produces a tree. Helpers here cover the handful
//! of edits the transcoder and the rule engine need: detach, unwrap, rename,
//! insert, attribute edits and text extraction.
//!
//! Pages in the wild nest elements tens of thousands deep, so every walk
//! here runs on an explicit stack or on kuchikikiki's iterators, never on
//! the call stack.

use kuchikikiki::iter::NodeEdge;
use kuchikikiki::traits::TendrilSink;
use kuchikikiki::{Attribute, ElementData, ExpandedName, NodeDataRef, ParseOpts};
use once_cell::sync::Lazy;
use regex::Regex;

pub use kuchikikiki::NodeRef;

pub(crate) const HTML_NS: &str = "http://www.w3.org/1999/xhtml";

static DOCUMENT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(?:!doctype|html|head|body)[\s>/]").unwrap());

thread_local! {
    /// `<body>` of an empty document. Fragment parsing uses it as context
    /// and new HTML elements copy its qualified name.
    static BODY: Option<NodeDataRef<ElementData>> = kuchikikiki::parse_html().one("").select_first("body").ok();
}

fn parse_opts() -> ParseOpts {
    let mut opts = ParseOpts::default();
    // Parse <noscript> content as markup, it is what legacy clients render.
    opts.tree_builder.scripting_enabled = false;
    opts
}

/// A parsed page or fragment.
pub struct Document {
    node: NodeRef,
    fragment: bool,
}

impl Document {
    /// Parse `html` leniently.
    ///
    /// Input that carries document structure (doctype, `<html>`, `<head>`,
    /// `<body>`) is parsed as a full document; anything else is parsed as a
    /// body fragment so no synthetic wrappers appear in the output.
    pub fn parse(html: &str) -> Self {
        if !looks_like_document(html) {
            let context = BODY.with(|body| body.as_ref().map(|b| b.name.clone()));
            if let Some(context) = context {
                let node = kuchikikiki::parse_fragment_with_options(parse_opts(), context, Vec::new()).one(html);
                return Self { node, fragment: true };
            }
        }
        let node = kuchikikiki::parse_html_with_options(parse_opts()).one(html);
        Self { node, fragment: false }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// Node whose children make up the serialized output.
    ///
    /// For fragments this is the synthetic `<html>` element the fragment
    /// parser creates; for documents it is the document node itself.
    pub fn root(&self) -> NodeRef {
        if self.fragment {
            if let Some(html) = self.node.first_child() {
                return html;
            }
        }
        self.node.clone()
    }
}

fn looks_like_document(html: &str) -> bool {
    let head: String = html.trim_start().chars().take(4096).collect();
    DOCUMENT_MARKER.is_match(&head)
}

/// Parse a snippet of markup into detached nodes ready for insertion.
pub fn parse_nodes(html: &str) -> Vec<NodeRef> {
    // The leading span keeps fragment detection and is discarded below.
    let doc = Document::parse(&format!("<span></span>{html}"));
    let nodes: Vec<NodeRef> = doc.root().children().skip(1).collect();
    for node in &nodes {
        node.detach();
    }
    nodes
}

/// Lowercase local name of an element, `None` for other node kinds.
pub fn tag_name(node: &NodeRef) -> Option<&str> {
    node.as_element().map(|el| &*el.name.local)
}

pub fn is_element(node: &NodeRef, tag: &str) -> bool {
    tag_name(node) == Some(tag)
}

pub fn get_attr(node: &NodeRef, attr: &str) -> Option<String> {
    let el = node.as_element()?;
    let attrs = el.attributes.borrow();
    attrs
        .map
        .iter()
        .find(|(name, a)| attr_name(name, a) == attr)
        .map(|(_, a)| a.value.clone())
}

pub fn has_attr(node: &NodeRef, attr: &str) -> bool {
    node.as_element().is_some_and(|el| {
        el.attributes
            .borrow()
            .map
            .iter()
            .any(|(name, a)| attr_name(name, a) == attr)
    })
}

/// Set (or add) an attribute value.
pub fn set_attr(node: &NodeRef, attr: &str, value: &str) {
    let Some(el) = node.as_element() else {
        return;
    };
    let mut attrs = el.attributes.borrow_mut();
    match attrs.map.iter_mut().find(|(name, a)| attr_name(name, a) == attr) {
        Some((_, existing)) => existing.value = value.to_string(),
        None => {
            attrs.insert(attr, value.to_string());
        }
    }
}

/// Remove an attribute; returns whether it was present.
pub fn remove_attr(node: &NodeRef, attr: &str) -> bool {
    let mut removed = false;
    retain_attrs(node, |name| {
        let keep = name != attr;
        removed |= !keep;
        keep
    });
    removed
}

/// Keep only the attributes whose written name passes `keep`.
pub fn retain_attrs(node: &NodeRef, mut keep: impl FnMut(&str) -> bool) {
    if let Some(el) = node.as_element() {
        el.attributes
            .borrow_mut()
            .map
            .retain(|name, a| keep(&attr_name(name, a)));
    }
}

/// Attribute name as written in markup (`xlink:href` keeps its prefix).
pub fn attr_name(name: &ExpandedName, attr: &Attribute) -> String {
    match &attr.prefix {
        Some(prefix) => format!("{}:{}", prefix, &*name.local),
        None => name.local.to_string(),
    }
}

/// Class tokens of an element.
pub fn classes(node: &NodeRef) -> Vec<String> {
    get_attr(node, "class")
        .map(|c| c.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Whether `node` sits anywhere below an element named `tag`.
pub fn has_ancestor(node: &NodeRef, tag: &str) -> bool {
    node.ancestors().any(|a| is_element(&a, tag))
}

/// Element descendants of `root` in document order, excluding `root`.
///
/// Returned as a snapshot so callers may mutate the tree while iterating.
pub fn elements(root: &NodeRef) -> Vec<NodeRef> {
    root.descendants().filter(|n| n.as_element().is_some()).collect()
}

pub fn elements_named(root: &NodeRef, tags: &[&str]) -> Vec<NodeRef> {
    root.descendants()
        .filter(|n| tag_name(n).is_some_and(|t| tags.contains(&t)))
        .collect()
}

/// Element descendants of `root`, each paired with whether it sits below an
/// element named `within`. One walk, so cost does not grow with depth.
pub fn elements_flagged_within(root: &NodeRef, within: &str) -> Vec<(NodeRef, bool)> {
    let mut out = Vec::new();
    let mut open = 0usize;
    for edge in root.traverse() {
        match edge {
            NodeEdge::Start(node) if node.as_element().is_some() => {
                let inside = open > 0;
                if is_element(&node, within) {
                    open += 1;
                }
                out.push((node, inside));
            }
            NodeEdge::End(node) if is_element(&node, within) => open = open.saturating_sub(1),
            _ => {}
        }
    }
    out
}

/// Whether `node` is still attached below `root`.
pub fn is_attached_to(node: &NodeRef, root: &NodeRef) -> bool {
    node.inclusive_ancestors().any(|n| n == *root)
}

/// Concatenated text of all descendant text nodes.
pub fn text_content(node: &NodeRef) -> String {
    node.text_contents()
}

fn element_like(
    template: &ElementData,
    tag: &str,
    attributes: impl IntoIterator<Item = (ExpandedName, Attribute)>,
) -> NodeRef {
    let mut name = template.name.clone();
    name.local = tag.into();
    NodeRef::new_element(name, attributes)
}

/// A detached HTML element. `None` only if the parser could not produce
/// a `<body>` to take the element name from.
pub fn create_element(tag: &str, attrs: &[(&str, &str)]) -> Option<NodeRef> {
    let node = BODY.with(|body| body.as_ref().map(|b| element_like(b, tag, std::iter::empty())))?;
    for (name, value) in attrs {
        set_attr(&node, name, value);
    }
    Some(node)
}

/// A detached element named `tag` in the namespace of `sibling`.
pub fn create_element_like(sibling: &NodeRef, tag: &str) -> Option<NodeRef> {
    sibling
        .as_element()
        .map(|el| element_like(el, tag, std::iter::empty()))
}

pub fn create_text(text: &str) -> NodeRef {
    NodeRef::new_text(text)
}

/// Remove `node` (and its subtree) from the tree.
pub fn detach(node: &NodeRef) {
    node.detach();
}

/// Replace `node` with `replacements`, keeping their order.
pub fn replace_with(node: &NodeRef, replacements: Vec<NodeRef>) {
    if node.parent().is_none() {
        return;
    }
    for r in replacements {
        node.insert_before(r);
    }
    node.detach();
}

/// Remove the element but keep its children in its place.
pub fn unwrap(node: &NodeRef) {
    if node.parent().is_none() {
        return;
    }
    while let Some(child) = node.first_child() {
        node.insert_before(child);
    }
    node.detach();
}

pub fn insert_before(node: &NodeRef, new_nodes: Vec<NodeRef>) {
    if node.parent().is_none() {
        return;
    }
    for n in new_nodes {
        node.insert_before(n);
    }
}

pub fn insert_after(node: &NodeRef, new_nodes: Vec<NodeRef>) {
    if node.parent().is_none() {
        return;
    }
    for n in new_nodes.into_iter().rev() {
        node.insert_after(n);
    }
}

pub fn append_children(parent: &NodeRef, new_nodes: Vec<NodeRef>) {
    for n in new_nodes {
        parent.append(n);
    }
}

pub fn prepend_children(parent: &NodeRef, new_nodes: Vec<NodeRef>) {
    for n in new_nodes.into_iter().rev() {
        parent.prepend(n);
    }
}

/// Replace all children with a single text node.
pub fn set_text(node: &NodeRef, text: &str) {
    while let Some(child) = node.first_child() {
        child.detach();
    }
    node.append(create_text(text));
}

/// Swap the element for one named `tag`, carrying attributes and children over.
pub fn rename(node: &NodeRef, tag: &str) -> Option<NodeRef> {
    let el = node.as_element()?;
    node.parent()?;
    let attributes = el.attributes.borrow().map.clone();
    let renamed = element_like(el, tag, attributes);
    while let Some(child) = node.first_child() {
        renamed.append(child);
    }
    node.insert_before(renamed.clone());
    node.detach();
    Some(renamed)
}

/// Wrap `node` in a new element named `tag`.
pub fn wrap(node: &NodeRef, tag: &str) -> Option<NodeRef> {
    node.parent()?;
    let wrapper = create_element(tag, &[])?;
    node.insert_before(wrapper.clone());
    wrapper.append(node.clone());
    Some(wrapper)
}

/// Copy a subtree. The copy is detached.
pub fn deep_clone(node: &NodeRef) -> NodeRef {
    let copy = shallow_clone(node);
    let mut stack = vec![(node.clone(), copy.clone())];
    while let Some((source, target)) = stack.pop() {
        for child in source.children() {
            let child_copy = shallow_clone(&child);
            target.append(child_copy.clone());
            stack.push((child, child_copy));
        }
    }
    copy
}

fn shallow_clone(node: &NodeRef) -> NodeRef {
    if let Some(el) = node.as_element() {
        NodeRef::new_element(el.name.clone(), el.attributes.borrow().map.clone())
    } else if let Some(text) = node.as_text() {
        NodeRef::new_text(text.borrow().clone())
    } else if let Some(comment) = node.as_comment() {
        NodeRef::new_comment(comment.borrow().clone())
    } else if let Some(doctype) = node.as_doctype() {
        NodeRef::new_doctype(
            doctype.name.clone(),
            doctype.public_id.clone(),
            doctype.system_id.clone(),
        )
    } else {
        NodeRef::new_document()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::serialize::{serialize, OutputFormat};

    fn render(doc: &Document) -> String {
        serialize(doc, OutputFormat::Minimal)
    }

    #[test]
    fn fragments_get_no_synthetic_wrappers() {
        let doc = Document::parse("<p>Hi</p>");
        assert!(doc.is_fragment());
        assert_eq!(render(&doc), "<p>Hi</p>");
    }

    #[test]
    fn documents_are_detected() {
        let doc = Document::parse("<!DOCTYPE html><title>t</title><p>x");
        assert!(!doc.is_fragment());
        let out = render(&doc);
        assert!(out.starts_with("<!DOCTYPE html>"));
        assert!(out.contains("<body><p>x</p></body>"));
    }

    #[test]
    fn malformed_markup_still_parses() {
        let doc = Document::parse("<div><p>one<p>two</div></span><b>bold");
        assert_eq!(render(&doc), "<div><p>one</p><p>two</p></div><b>bold</b>");
    }

    #[test]
    fn unwrap_keeps_children_in_order() {
        let doc = Document::parse("<section><div>a<b>b</b>c</div>d</section>");
        let div = elements_named(&doc.root(), &["div"]).remove(0);
        unwrap(&div);
        assert_eq!(render(&doc), "<section>a<b>b</b>cd</section>");
    }

    #[test]
    fn detach_removes_subtree() {
        let doc = Document::parse("<p>keep<span>drop <i>me</i></span></p>");
        let span = elements_named(&doc.root(), &["span"]).remove(0);
        detach(&span);
        assert_eq!(render(&doc), "<p>keep</p>");
    }

    #[test]
    fn rename_carries_attributes_and_children() {
        let doc = Document::parse(r#"<h1 id="t">Title <i>x</i></h1>"#);
        let h1 = elements_named(&doc.root(), &["h1"]).remove(0);
        assert!(rename(&h1, "b").is_some());
        assert_eq!(render(&doc), r#"<b id="t">Title <i>x</i></b>"#);
    }

    #[test]
    fn insert_and_wrap() {
        let doc = Document::parse("<p>a</p>");
        let p = elements_named(&doc.root(), &["p"]).remove(0);
        insert_after(&p, parse_nodes("<br><hr>"));
        insert_before(&p, vec![create_text("start")]);
        assert!(wrap(&p, "center").is_some());
        assert_eq!(render(&doc), "start<center><p>a</p></center><br><hr>");
    }

    #[test]
    fn attribute_edits() {
        let doc = Document::parse(r#"<a href="x" class="c d">l</a>"#);
        let a = elements_named(&doc.root(), &["a"]).remove(0);
        assert_eq!(classes(&a), vec!["c", "d"]);
        assert!(remove_attr(&a, "class"));
        assert!(!remove_attr(&a, "class"));
        set_attr(&a, "href", "y");
        set_attr(&a, "title", "t");
        assert_eq!(get_attr(&a, "href").as_deref(), Some("y"));
        assert!(has_attr(&a, "title"));
        let out = render(&doc);
        assert!(out.contains(r#"href="y""#), "{out}");
        assert!(out.contains(r#"title="t""#), "{out}");
        assert!(!out.contains("class"), "{out}");
    }

    #[test]
    fn text_content_and_ancestors() {
        let doc = Document::parse("<pre>a<b>b</b></pre>");
        let b = elements_named(&doc.root(), &["b"]).remove(0);
        assert!(has_ancestor(&b, "pre"));
        let pre = elements_named(&doc.root(), &["pre"]).remove(0);
        assert!(!has_ancestor(&pre, "pre"));
        assert_eq!(text_content(&pre), "ab");
    }

    #[test]
    fn flags_mark_descendants_but_not_the_element_itself() {
        let doc = Document::parse("<p>x</p><pre><b>y</b></pre><i>z</i>");
        let flagged: Vec<(String, bool)> = elements_flagged_within(&doc.root(), "pre")
            .into_iter()
            .map(|(n, inside)| (tag_name(&n).unwrap_or_default().to_string(), inside))
            .collect();
        assert_eq!(
            flagged,
            vec![
                ("p".to_string(), false),
                ("pre".to_string(), false),
                ("b".to_string(), true),
                ("i".to_string(), false),
            ]
        );
    }

    #[test]
    fn deep_clone_is_independent() {
        let doc = Document::parse("<div><p>x</p><!--c--></div>");
        let div = elements_named(&doc.root(), &["div"]).remove(0);
        let copy = deep_clone(&div);
        assert_eq!(text_content(&copy), "x");
        set_text(&copy, "changed");
        assert_eq!(render(&doc), "<div><p>x</p><!--c--></div>");
        assert_eq!(text_content(&copy), "changed");
    }

    #[test]
    fn deep_trees_walk_without_recursion() {
        let depth = 100_000;
        let html = format!("{}x", "<span>".repeat(depth));
        let doc = Document::parse(&html);
        let root = doc.root();
        assert_eq!(elements(&root).len(), depth);
        assert_eq!(text_content(&root), "x");
        let innermost = elements_named(&root, &["span"]).pop().unwrap();
        assert!(is_attached_to(&innermost, &root));
        let copy = deep_clone(&root);
        assert_eq!(text_content(&copy), "x");
    }
}
