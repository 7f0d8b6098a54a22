//! Inline SVG: canonical serialization and rasterization.
//!
//! An inline `<svg>` is cloned out of the page, its `<use>` references are
//! resolved against the page, and the result is serialized as standalone
//! XML. Identical graphics therefore hash identically. The XML is then
//! rendered with resvg.

use image::{DynamicImage, RgbaImage};
use resvg::tiny_skia;
use resvg::usvg;

use super::ImageError;
use crate::transcode::dom::{self, NodeRef};
use crate::transcode::serialize::serialize_xml;

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Upper bound on rendered pixels.
const MAX_SVG_PIXELS: u64 = 16 * 1024 * 1024;

/// Nested `<use>` chains are followed this deep.
const MAX_USE_DEPTH: usize = 8;

/// Standalone XML for the `<svg>` element `svg`, with `<use>` resolved
/// against the elements under `page_root`.
pub fn canonical_svg(svg: &NodeRef, page_root: &NodeRef) -> String {
    let copy = dom::deep_clone(svg);

    for _ in 0..MAX_USE_DEPTH {
        let uses = dom::elements_named(&copy, &["use"]);
        if uses.is_empty() {
            break;
        }
        for node in uses {
            resolve_use(&node, &copy, page_root);
        }
    }

    if !dom::has_attr(&copy, "xmlns") {
        dom::set_attr(&copy, "xmlns", SVG_NS);
    }
    for node in std::iter::once(copy.clone()).chain(dom::elements(&copy)) {
        if let Some(target) = dom::get_attr(&node, "xlink:href") {
            dom::remove_attr(&node, "xlink:href");
            if !dom::has_attr(&node, "href") {
                dom::set_attr(&node, "href", &target);
            }
        }
    }

    serialize_xml(&copy)
}

fn use_target(node: &NodeRef) -> Option<String> {
    dom::get_attr(node, "href")
        .or_else(|| dom::get_attr(node, "xlink:href"))
        .and_then(|href| href.strip_prefix('#').map(str::to_string))
}

fn find_by_id(root: &NodeRef, id: &str) -> Option<NodeRef> {
    dom::elements(root)
        .into_iter()
        .find(|n| dom::get_attr(n, "id").as_deref() == Some(id))
}

/// Inline the referenced element in place of `<use>`.
///
/// Unresolvable references are dropped so the renderer never chases
/// external documents.
fn resolve_use(node: &NodeRef, svg_root: &NodeRef, page_root: &NodeRef) {
    let Some(target) = use_target(node).and_then(|id| find_by_id(page_root, &id)) else {
        dom::detach(node);
        return;
    };

    let Some(group) = dom::create_element_like(node, "g") else {
        dom::detach(node);
        return;
    };
    if let Some(transform) = use_transform(node) {
        dom::set_attr(&group, "transform", &transform);
    }
    for attr in ["fill", "stroke", "class", "style", "opacity"] {
        if let Some(value) = dom::get_attr(node, attr) {
            dom::set_attr(&group, attr, &value);
        }
    }

    if dom::is_element(&target, "symbol") {
        if let Some(view_box) = dom::get_attr(&target, "viewBox") {
            if !dom::has_attr(svg_root, "viewBox") {
                dom::set_attr(svg_root, "viewBox", &view_box);
            }
        }
        let children: Vec<NodeRef> = target.children().map(|c| dom::deep_clone(&c)).collect();
        dom::append_children(&group, children);
    } else {
        let copy = dom::deep_clone(&target);
        dom::remove_attr(&copy, "id");
        dom::append_children(&group, vec![copy]);
    }

    dom::replace_with(node, vec![group]);
}

fn use_transform(node: &NodeRef) -> Option<String> {
    let x = dom::get_attr(node, "x").unwrap_or_default();
    let y = dom::get_attr(node, "y").unwrap_or_default();
    let translate = if x.is_empty() && y.is_empty() {
        None
    } else {
        let x = if x.is_empty() { "0".to_string() } else { x };
        let y = if y.is_empty() { "0".to_string() } else { y };
        Some(format!("translate({x} {y})"))
    };
    match (dom::get_attr(node, "transform"), translate) {
        (Some(t), Some(tr)) => Some(format!("{t} {tr}")),
        (Some(t), None) => Some(t),
        (None, tr) => tr,
    }
}

/// Text of the graphic's `<title>`, if any.
pub fn title(svg: &NodeRef) -> Option<String> {
    dom::elements_named(svg, &["title"])
        .first()
        .map(|t| dom::text_content(t).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Render SVG markup to an RGBA image.
pub fn rasterize(svg: &[u8]) -> Result<DynamicImage, ImageError> {
    let options = usvg::Options::default();
    let tree = usvg::Tree::from_data(svg, &options).map_err(|e| ImageError::Svg(e.to_string()))?;
    let size = tree.size().to_int_size();
    let (width, height) = (size.width(), size.height());
    let pixels = u64::from(width) * u64::from(height);
    if pixels == 0 || pixels > MAX_SVG_PIXELS {
        return Err(ImageError::Svg(format!("unsupported size {width}x{height}")));
    }

    let mut pixmap = tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| ImageError::Svg("pixmap allocation failed".into()))?;
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());

    // tiny-skia stores premultiplied alpha.
    let mut data = pixmap.take();
    for px in data.chunks_exact_mut(4) {
        let a = u16::from(px[3]);
        if a > 0 && a < 255 {
            for c in &mut px[..3] {
                *c = u8::try_from(u16::from(*c) * 255 / a).unwrap_or(u8::MAX);
            }
        }
    }
    let rgba = RgbaImage::from_raw(width, height, data)
        .ok_or_else(|| ImageError::Svg("pixel buffer size mismatch".into()))?;
    Ok(DynamicImage::ImageRgba8(rgba))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::Document;

    fn first_svg(doc: &Document) -> NodeRef {
        dom::elements_named(&doc.root(), &["svg"]).remove(0)
    }

    #[test]
    fn canonical_form_adds_namespace() {
        let doc = Document::parse(r#"<svg width="4" height="4"><rect width="4" height="4"/></svg>"#);
        let xml = canonical_svg(&first_svg(&doc), &doc.root());
        assert_eq!(
            xml,
            r#"<svg width="4" height="4" xmlns="http://www.w3.org/2000/svg"><rect width="4" height="4"/></svg>"#
        );
    }

    #[test]
    fn identical_graphics_serialize_identically() {
        let a = Document::parse(r#"<p>a<svg viewBox="0 0 2 2"><circle r="1"/></svg></p>"#);
        let b = Document::parse(r#"<div><svg viewBox="0 0 2 2"><circle r="1"></circle></svg></div>"#);
        assert_eq!(
            canonical_svg(&first_svg(&a), &a.root()),
            canonical_svg(&first_svg(&b), &b.root())
        );
    }

    #[test]
    fn use_of_symbol_is_inlined_with_viewbox() {
        let doc = Document::parse(concat!(
            r#"<svg style="display:none"><symbol id="icon" viewBox="0 0 24 24"><path d="M0 0h24v24z"/></symbol></svg>"#,
            r##"<svg width="24" height="24"><use xlink:href="#icon" x="2"/></svg>"##,
        ));
        let using = dom::elements_named(&doc.root(), &["svg"]).remove(1);
        let xml = canonical_svg(&using, &doc.root());
        assert!(xml.contains(r#"viewBox="0 0 24 24""#), "{xml}");
        assert!(xml.contains(r#"<g transform="translate(2 0)"><path d="M0 0h24v24z"/></g>"#), "{xml}");
        assert!(!xml.contains("<use"));
        assert!(!xml.contains("symbol"));
    }

    #[test]
    fn dangling_use_is_dropped() {
        let doc = Document::parse(r##"<svg width="2" height="2"><use href="#missing"/></svg>"##);
        let xml = canonical_svg(&first_svg(&doc), &doc.root());
        assert!(!xml.contains("use"));
    }

    #[test]
    fn rasterizes_simple_graphic() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="8" height="4"><rect width="8" height="4" fill="black"/></svg>"#;
        let img = rasterize(svg).unwrap();
        assert_eq!((img.width(), img.height()), (8, 4));
        assert_eq!(img.to_rgba8().get_pixel(0, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn broken_markup_is_an_error() {
        assert!(matches!(rasterize(b"<svg"), Err(ImageError::Svg(_))));
    }

    #[test]
    fn title_becomes_alt_text() {
        let doc = Document::parse("<svg><title> Site logo </title></svg>");
        assert_eq!(title(&first_svg(&doc)).as_deref(), Some("Site logo"));
    }
}
