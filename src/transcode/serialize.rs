//! Legacy-friendly HTML serializer.
//!
//! Void elements are written bare (`<br>`, never `<br/>`), `href`/`src`
//! values are written without entity escaping, and the `html` output mode
//! encodes every non-ASCII character as a numeric reference for clients
//! with a narrow character set.

use kuchikikiki::iter::NodeEdge;
use serde::{Deserialize, Serialize};

use super::dom::{attr_name, Document, NodeRef, HTML_NS};

/// How text outside ASCII is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Escape only markup-significant characters.
    #[default]
    Minimal,
    /// Additionally encode every non-ASCII character as `&#N;`.
    Html,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

/// Elements where the parser drops a leading newline.
const NEWLINE_ELEMENTS: &[&str] = &["pre", "textarea", "listing"];

const UNESCAPED_ATTRS: &[&str] = &["href", "src"];

pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

/// Serialize a whole document or fragment.
pub fn serialize(doc: &Document, format: OutputFormat) -> String {
    serialize_children(&doc.root(), format)
}

/// Serialize the children of `node`, not the node itself.
pub fn serialize_children(node: &NodeRef, format: OutputFormat) -> String {
    let mut out = String::new();
    for child in node.children() {
        write_subtree(&child, format, &mut out);
    }
    out
}

/// Serialize `node` including its own tag.
pub fn serialize_node(node: &NodeRef, format: OutputFormat) -> String {
    let mut out = String::new();
    write_subtree(node, format, &mut out);
    out
}

/// Local name of an HTML-namespace element.
fn html_tag(node: &NodeRef) -> Option<&str> {
    node.as_element()
        .filter(|el| &*el.name.ns == HTML_NS)
        .map(|el| &*el.name.local)
}

fn is_raw_text_parent(node: &NodeRef) -> bool {
    node.parent()
        .is_some_and(|p| html_tag(&p).is_some_and(|t| RAW_TEXT_ELEMENTS.contains(&t)))
}

fn write_subtree(node: &NodeRef, format: OutputFormat, out: &mut String) {
    for edge in node.traverse_inclusive() {
        match edge {
            NodeEdge::Start(n) => write_open(&n, format, out),
            NodeEdge::End(n) => write_close(&n, out),
        }
    }
}

fn write_open(node: &NodeRef, format: OutputFormat, out: &mut String) {
    if let Some(el) = node.as_element() {
        let tag = &*el.name.local;
        out.push('<');
        out.push_str(tag);
        for (name, attr) in &el.attributes.borrow().map {
            let key = attr_name(name, attr);
            out.push(' ');
            out.push_str(&key);
            if attr.value.is_empty() {
                continue;
            }
            out.push_str("=\"");
            if UNESCAPED_ATTRS.contains(&key.as_str()) {
                push_url(&attr.value, out);
            } else {
                escape_attr(&attr.value, format, out);
            }
            out.push('"');
        }
        out.push('>');

        if html_tag(node).is_some_and(|t| NEWLINE_ELEMENTS.contains(&t)) {
            let leading_newline = node
                .first_child()
                .and_then(|c| c.as_text().map(|t| t.borrow().starts_with('\n')))
                .unwrap_or(false);
            if leading_newline {
                out.push('\n');
            }
        }
    } else if let Some(text) = node.as_text() {
        let text = text.borrow();
        if is_raw_text_parent(node) {
            out.push_str(&text);
        } else {
            escape_text(&text, format, out);
        }
    } else if let Some(comment) = node.as_comment() {
        out.push_str("<!--");
        out.push_str(&comment.borrow());
        out.push_str("-->");
    } else if let Some(doctype) = node.as_doctype() {
        out.push_str("<!DOCTYPE ");
        out.push_str(&doctype.name);
        if !doctype.public_id.is_empty() {
            out.push_str(" PUBLIC \"");
            out.push_str(&doctype.public_id);
            out.push('"');
            if !doctype.system_id.is_empty() {
                out.push_str(" \"");
                out.push_str(&doctype.system_id);
                out.push('"');
            }
        } else if !doctype.system_id.is_empty() {
            out.push_str(" SYSTEM \"");
            out.push_str(&doctype.system_id);
            out.push('"');
        }
        out.push('>');
    }
}

fn write_close(node: &NodeRef, out: &mut String) {
    let Some(el) = node.as_element() else {
        return;
    };
    if html_tag(node).is_some_and(is_void) {
        return;
    }
    out.push_str("</");
    out.push_str(&el.name.local);
    out.push('>');
}

fn escape_text(text: &str, format: OutputFormat, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => push_char(c, format, out),
        }
    }
}

fn escape_attr(value: &str, format: OutputFormat, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => push_char(c, format, out),
        }
    }
}

/// URLs go out as-is; only a bare quote would break the attribute.
fn push_url(value: &str, out: &mut String) {
    for c in value.chars() {
        if c == '"' {
            out.push_str("%22");
        } else {
            out.push(c);
        }
    }
}

fn push_char(c: char, format: OutputFormat, out: &mut String) {
    if format == OutputFormat::Html && !c.is_ascii() {
        out.push_str("&#");
        out.push_str(&u32::from(c).to_string());
        out.push(';');
    } else {
        out.push(c);
    }
}

/// Serialize a subtree as standalone XML (used for SVG rasterization).
///
/// Element and attribute names keep their case, childless elements
/// self-close and every attribute value is escaped.
pub fn serialize_xml(node: &NodeRef) -> String {
    let mut out = String::new();
    for edge in node.traverse_inclusive() {
        match edge {
            NodeEdge::Start(n) => {
                if let Some(el) = n.as_element() {
                    out.push('<');
                    out.push_str(&el.name.local);
                    for (name, attr) in &el.attributes.borrow().map {
                        out.push(' ');
                        out.push_str(&attr_name(name, attr));
                        out.push_str("=\"");
                        out.push_str(&html_escape::encode_double_quoted_attribute(&attr.value));
                        out.push('"');
                    }
                    out.push_str(if n.first_child().is_some() { ">" } else { "/>" });
                } else if let Some(text) = n.as_text() {
                    out.push_str(&html_escape::encode_text(&*text.borrow()));
                }
            }
            NodeEdge::End(n) => {
                if let Some(el) = n.as_element() {
                    if n.first_child().is_some() {
                        out.push_str("</");
                        out.push_str(&el.name.local);
                        out.push('>');
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(html: &str) -> String {
        serialize(&Document::parse(html), OutputFormat::Minimal)
    }

    #[test]
    fn void_elements_are_bare() {
        assert_eq!(roundtrip(r#"a<br/>b<hr />c<img src="x.gif" />"#), r#"a<br>b<hr>c<img src="x.gif">"#);
        let out = roundtrip("<p>one<br/>two</p><hr/>");
        assert!(!out.contains("<br/>"));
        assert!(!out.contains("<hr/>"));
        assert_eq!(out, "<p>one<br>two</p><hr>");
    }

    #[test]
    fn href_and_src_are_not_escaped() {
        let out = roundtrip(r#"<a href="/q?a=1&amp;b=2" title="x &amp; y">l</a>"#);
        assert_eq!(out, r#"<a href="/q?a=1&b=2" title="x &amp; y">l</a>"#);
    }

    #[test]
    fn quotes_inside_urls_cannot_break_the_attribute() {
        let out = roundtrip(r#"<a href='/x"y'>l</a>"#);
        assert_eq!(out, r#"<a href="/x%22y">l</a>"#);
    }

    #[test]
    fn text_is_escaped_but_scripts_are_raw() {
        let out = roundtrip("<p>1 &lt; 2 &amp; 3</p><script>if (a < b && c) {}</script>");
        assert_eq!(out, "<p>1 &lt; 2 &amp; 3</p><script>if (a < b && c) {}</script>");
    }

    #[test]
    fn boolean_attributes_stay_bare() {
        assert_eq!(
            roundtrip(r#"<input type="checkbox" checked>"#),
            r#"<input type="checkbox" checked>"#
        );
    }

    #[test]
    fn html_mode_encodes_non_ascii() {
        let doc = Document::parse("<p>caf\u{e9} \u{a0}</p>");
        assert_eq!(serialize(&doc, OutputFormat::Minimal), "<p>caf\u{e9} &nbsp;</p>");
        assert_eq!(serialize(&doc, OutputFormat::Html), "<p>caf&#233; &nbsp;</p>");
    }

    #[test]
    fn pre_leading_newline_survives() {
        let html = "<pre>\n\nindented\n  code</pre>";
        assert_eq!(roundtrip(html), html);
        assert_eq!(roundtrip(&roundtrip(html)), html);
    }

    #[test]
    fn doctype_with_public_id() {
        let html = r#"<!DOCTYPE HTML PUBLIC "-//W3C//DTD HTML 3.2 Final//EN"><title>t</title>"#;
        let out = roundtrip(html);
        assert!(out.starts_with(r#"<!DOCTYPE html PUBLIC "-//W3C//DTD HTML 3.2 Final//EN">"#));
    }

    #[test]
    fn xml_serialization_self_closes() {
        let doc = Document::parse(r#"<svg viewBox="0 0 1 1"><path d="M0 0"/><text>a&amp;b</text></svg>"#);
        let svg = crate::transcode::dom::elements_named(&doc.root(), &["svg"]).remove(0);
        assert_eq!(
            serialize_xml(&svg),
            r#"<svg viewBox="0 0 1 1"><path d="M0 0"/><text>a&amp;b</text></svg>"#
        );
    }

    #[test]
    fn deeply_nested_markup_serializes() {
        let depth = 100_000;
        let html = format!("{}x{}", "<span>".repeat(depth), "</span>".repeat(depth));
        let out = roundtrip(&html);
        assert!(out == html, "nested markup did not round-trip");

        let svg = format!("<svg>{}<rect/>{}</svg>", "<g>".repeat(depth), "</g>".repeat(depth));
        let doc = Document::parse(&svg);
        let node = crate::transcode::dom::elements_named(&doc.root(), &["svg"]).remove(0);
        assert!(serialize_xml(&node).contains("<rect/>"));
    }
}
