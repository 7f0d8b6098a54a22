//! Tree passes of the simplifier, one function per [`Pass`](super::Pass).
//!
//! Every pass leaves `<pre>` text untouched. Structural simplification also
//! leaves elements inside a `<pre>` in place; URL downgrades still apply there.

use std::borrow::Cow;

use tracing::debug;

use super::dom::{self, Document, NodeRef};
use super::downgrade::{downgrade_refresh, downgrade_text, downgrade_url};
use super::TranscodeConfig;
use crate::image::svg;

/// Attributes that carry a fetchable URL.
pub(crate) const URL_ATTRIBUTES: &[&str] = &["href", "src", "action", "background", "lowsrc", "xlink:href"];

/// Receiver for inline vector graphics that must become raster images.
///
/// Returns the local URL the rendered image is served from, or `None` when
/// rendering failed and the markup should stay as-is.
pub trait InlineImageSink: Send + Sync {
    fn store_inline_svg(&self, canonical_svg: &str) -> Option<String>;
}

/// Rewrite secure URL attributes to plain HTTP.
pub fn downgrade_urls(doc: &Document) -> usize {
    let mut rewritten = 0;
    for node in dom::elements(&doc.root()) {
        let Some(el) = node.as_element() else {
            continue;
        };
        for (name, attr) in &mut el.attributes.borrow_mut().map {
            if !URL_ATTRIBUTES.contains(&dom::attr_name(name, attr).as_str()) {
                continue;
            }
            let downgraded = match downgrade_url(&attr.value) {
                Cow::Owned(url) => Some(url),
                Cow::Borrowed(_) => None,
            };
            if let Some(url) = downgraded {
                attr.value = url;
                rewritten += 1;
            }
        }
    }
    rewritten
}

/// Unwrap, strip, then remove attributes, per `config`.
pub fn simplify_structure(doc: &Document, config: &TranscodeConfig) {
    let root = doc.root();
    let outside_pre = |tags: &[String]| -> Vec<NodeRef> {
        dom::elements_flagged_within(&root, "pre")
            .into_iter()
            .filter(|(node, in_pre)| {
                !in_pre && dom::tag_name(node).is_some_and(|t| tags.iter().any(|x| x == t))
            })
            .map(|(node, _)| node)
            .collect()
    };

    for node in outside_pre(&config.tags_to_unwrap) {
        dom::unwrap(&node);
    }

    let mut stripped = 0;
    for node in outside_pre(&config.tags_to_strip) {
        dom::detach(&node);
        stripped += 1;
    }

    if !config.attributes_to_strip.is_empty() {
        for (node, in_pre) in dom::elements_flagged_within(&root, "pre") {
            if in_pre {
                continue;
            }
            dom::retain_attrs(&node, |name| {
                !config.attributes_to_strip.iter().any(|p| attribute_matches(p, name))
            });
        }
    }
    debug!(stripped, "simplified structure");
}

/// `on*` style entries match by prefix, everything else exactly.
fn attribute_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern.eq_ignore_ascii_case(name),
    }
}

/// Downgrade `<meta http-equiv="refresh">` targets.
pub fn downgrade_refresh_meta(doc: &Document) {
    for meta in dom::elements_named(&doc.root(), &["meta"]) {
        let is_refresh = dom::get_attr(&meta, "http-equiv")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"));
        if !is_refresh {
            continue;
        }
        if let Some(content) = dom::get_attr(&meta, "content") {
            if let Cow::Owned(fixed) = downgrade_refresh(&content) {
                dom::set_attr(&meta, "content", &fixed);
            }
        }
    }
}

/// Downgrade `url()` and absolute references in `<style>` text and `style` attributes.
pub fn downgrade_inline_css(doc: &Document) {
    for node in dom::elements(&doc.root()) {
        if dom::is_element(&node, "style") {
            for child in node.children() {
                if let Some(text) = child.as_text() {
                    let fixed = downgrade_text(&text.borrow()).into_owned();
                    *text.borrow_mut() = fixed;
                }
            }
        }
        if let Some(style) = dom::get_attr(&node, "style") {
            if let Cow::Owned(fixed) = downgrade_text(&style) {
                dom::set_attr(&node, "style", &fixed);
            }
        }
    }
}

/// Replace outermost inline `<svg>` elements with cached raster images.
pub fn rasterize_svg(doc: &Document, sink: &dyn InlineImageSink) {
    let root = doc.root();
    let outermost: Vec<NodeRef> = dom::elements_flagged_within(&root, "svg")
        .into_iter()
        .filter(|(node, in_svg)| !in_svg && dom::is_element(node, "svg"))
        .map(|(node, _)| node)
        .collect();

    for node in outermost {
        let canonical = svg::canonical_svg(&node, &root);
        let Some(src) = sink.store_inline_svg(&canonical) else {
            debug!("inline svg left in place");
            continue;
        };
        let mut attrs = vec![("src", src.as_str())];
        let alt = svg::title(&node);
        if let Some(alt) = alt.as_deref() {
            attrs.push(("alt", alt));
        }
        if let Some(img) = dom::create_element("img", &attrs) {
            dom::replace_with(&node, vec![img]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::serialize::{serialize, OutputFormat};

    fn config(unwrap: &[&str], strip: &[&str], attrs: &[&str]) -> TranscodeConfig {
        TranscodeConfig {
            simplify_html: true,
            tags_to_unwrap: unwrap.iter().map(|s| (*s).to_string()).collect(),
            tags_to_strip: strip.iter().map(|s| (*s).to_string()).collect(),
            attributes_to_strip: attrs.iter().map(|s| (*s).to_string()).collect(),
            ..TranscodeConfig::default()
        }
    }

    fn render(doc: &Document) -> String {
        serialize(doc, OutputFormat::Minimal)
    }

    #[test]
    fn downgrades_every_url_attribute() {
        let doc = Document::parse(
            r#"<a href="https://a.example/">a</a><img src="//cdn.example/i.png"><form action="https://f.example/post"></form><a href="/rel">r</a>"#,
        );
        assert_eq!(downgrade_urls(&doc), 3);
        let out = render(&doc);
        assert!(out.contains(r#"href="http://a.example/""#));
        assert!(out.contains(r#"src="http://cdn.example/i.png""#));
        assert!(out.contains(r#"action="http://f.example/post""#));
        assert!(out.contains(r#"href="/rel""#));
    }

    #[test]
    fn strip_removes_subtree_unwrap_keeps_children() {
        let doc = Document::parse("<section>a<span>b<i>c</i></span>d</section><nav>menu<b>x</b></nav>e");
        simplify_structure(&doc, &config(&["section", "span"], &["nav"], &[]));
        assert_eq!(render(&doc), "ab<i>c</i>de");
    }

    #[test]
    fn attributes_are_removed_everywhere_but_pre() {
        let doc = Document::parse(
            r#"<p class="x" onclick="f()" onmouseover="g()">t</p><pre class="code"><b class="k">fn</b></pre>"#,
        );
        simplify_structure(&doc, &config(&[], &[], &["class", "on*"]));
        assert_eq!(render(&doc), r#"<p>t</p><pre><b class="k">fn</b></pre>"#);
    }

    #[test]
    fn pre_contents_are_protected() {
        let doc = Document::parse("<pre><span>  keep\n <script>x</script></span></pre>");
        simplify_structure(&doc, &config(&["span"], &["script"], &[]));
        assert_eq!(render(&doc), "<pre><span>  keep\n <script>x</script></span></pre>");
    }

    #[test]
    fn refresh_and_inline_css() {
        let doc = Document::parse(
            r#"<!DOCTYPE html><html><head><meta http-equiv="Refresh" content="0; url=https://next.example/"><style>b{background:url(https://x.example/b.png)}</style></head><body><p style="background:url('//y.example/a.gif')">x</p></body></html>"#,
        );
        downgrade_refresh_meta(&doc);
        downgrade_inline_css(&doc);
        let out = render(&doc);
        assert!(out.contains("url=http://next.example/"));
        assert!(out.contains("url(http://x.example/b.png)"));
        assert!(out.contains("url('http://y.example/a.gif')"));
        assert!(!out.contains("https://"));
    }

    struct FixedSink;

    impl InlineImageSink for FixedSink {
        fn store_inline_svg(&self, canonical_svg: &str) -> Option<String> {
            assert!(canonical_svg.starts_with("<svg"));
            Some("/cached_image/abc.gif".to_string())
        }
    }

    #[test]
    fn inline_svg_becomes_img() {
        let doc = Document::parse(
            r#"<p>logo <svg width="10" height="10"><title>Logo</title><svg><rect width="5" height="5"/></svg></svg></p>"#,
        );
        rasterize_svg(&doc, &FixedSink);
        assert_eq!(
            render(&doc),
            r#"<p>logo <img src="/cached_image/abc.gif" alt="Logo"></p>"#
        );
    }
}
