//! HTML simplifier.
//!
//! Turns arbitrary upstream HTML into markup a vintage browser can render.
//! The work is an explicit, ordered [`Pipeline`] of named [`Pass`]es:
//!
//! 1. [`Pass::ConvertCharacters`] (text level, before parsing)
//! 2. [`Pass::DowngradeUrls`]
//! 3. [`Pass::SimplifyStructure`] (skipped for whitelisted domains)
//! 4. [`Pass::DowngradeRefresh`]
//! 5. [`Pass::DowngradeInlineCss`]
//! 6. [`Pass::RasterizeSvg`] (only for clients without inline image support)
//!
//! Decoding, parsing and serialization frame the passes and always run.

pub mod dom;
pub mod downgrade;
pub mod passes;
pub mod serialize;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::charset::ConversionTable;
use crate::http_client::{host_matches, host_of};

pub use dom::Document;
pub use passes::InlineImageSink;
pub use serialize::OutputFormat;

/// What the simplifier does to a page.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub simplify_html: bool,
    /// Removed, children kept in place.
    pub tags_to_unwrap: Vec<String>,
    /// Removed with all content.
    pub tags_to_strip: Vec<String>,
    /// Removed from every remaining element. A trailing `*` matches by prefix.
    pub attributes_to_strip: Vec<String>,
    pub convert_characters: bool,
    pub conversion_table: Arc<ConversionTable>,
    /// Pages from these domains (or their subdomains) keep their structure.
    pub whitelisted_domains: Vec<String>,
    pub can_render_inline_images: bool,
    pub output: OutputFormat,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            simplify_html: true,
            tags_to_unwrap: Vec::new(),
            tags_to_strip: ["script", "link", "style", "source", "picture"]
                .into_iter()
                .map(String::from)
                .collect(),
            attributes_to_strip: ["style", "onclick", "class", "bgcolor", "text", "link", "vlink"]
                .into_iter()
                .map(String::from)
                .collect(),
            convert_characters: true,
            conversion_table: Arc::new(ConversionTable::builtin()),
            whitelisted_domains: Vec::new(),
            can_render_inline_images: false,
            output: OutputFormat::Minimal,
        }
    }
}

impl TranscodeConfig {
    /// Whether `source_url` belongs to a whitelisted domain.
    pub fn is_whitelisted(&self, source_url: Option<&str>) -> bool {
        let Some(host) = source_url.and_then(host_of) else {
            return false;
        };
        self.whitelisted_domains
            .iter()
            .any(|domain| host_matches(&host, domain))
    }
}

/// A named step of the simplifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Table-driven glyph/entity substitution on the decoded text.
    ConvertCharacters,
    /// `https://` and `//` URL attributes become `http://`.
    DowngradeUrls,
    /// Unwrap, strip and attribute removal. Never touches `<pre>` content.
    SimplifyStructure,
    /// Meta refresh targets get the URL downgrade.
    DowngradeRefresh,
    /// `<style>` text and `style` attributes get the URL downgrade.
    DowngradeInlineCss,
    /// Inline `<svg>` becomes a cached raster `<img>`.
    RasterizeSvg,
}

impl Pass {
    pub fn name(self) -> &'static str {
        match self {
            Self::ConvertCharacters => "convert-characters",
            Self::DowngradeUrls => "downgrade-urls",
            Self::SimplifyStructure => "simplify-structure",
            Self::DowngradeRefresh => "downgrade-refresh",
            Self::DowngradeInlineCss => "downgrade-inline-css",
            Self::RasterizeSvg => "rasterize-svg",
        }
    }

    /// Runs on text before parsing rather than on the tree.
    pub fn is_text_level(self) -> bool {
        matches!(self, Self::ConvertCharacters)
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered passes. Reordering is a deliberate change to this list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    passes: Vec<Pass>,
}

impl Pipeline {
    /// The standard order, with passes disabled by `config` left out.
    pub fn for_config(config: &TranscodeConfig) -> Self {
        let mut passes = Vec::with_capacity(6);
        if config.convert_characters {
            passes.push(Pass::ConvertCharacters);
        }
        passes.push(Pass::DowngradeUrls);
        if config.simplify_html {
            passes.push(Pass::SimplifyStructure);
        }
        passes.push(Pass::DowngradeRefresh);
        passes.push(Pass::DowngradeInlineCss);
        if !config.can_render_inline_images {
            passes.push(Pass::RasterizeSvg);
        }
        Self { passes }
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn contains(&self, pass: Pass) -> bool {
        self.passes.contains(&pass)
    }
}

/// Reusable simplifier bound to one configuration.
#[derive(Clone)]
pub struct Transcoder {
    config: TranscodeConfig,
    pipeline: Pipeline,
    images: Option<Arc<dyn InlineImageSink>>,
}

impl fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcoder")
            .field("pipeline", &self.pipeline)
            .field("inline_images", &self.images.is_some())
            .finish_non_exhaustive()
    }
}

impl Transcoder {
    pub fn new(config: TranscodeConfig) -> Self {
        let pipeline = Pipeline::for_config(&config);
        Self {
            config,
            pipeline,
            images: None,
        }
    }

    /// Where rasterized inline SVG goes. Without a sink the pass is a no-op.
    #[must_use]
    pub fn with_inline_images(mut self, sink: Arc<dyn InlineImageSink>) -> Self {
        self.images = Some(sink);
        self
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Transcode raw response bytes. Invalid UTF-8 is replaced, never fatal.
    pub fn transcode(&self, body: &[u8], source_url: Option<&str>) -> String {
        self.transcode_str(&String::from_utf8_lossy(body), source_url)
    }

    #[instrument(level = "debug", skip(self, html), fields(len = html.len()))]
    pub fn transcode_str(&self, html: &str, source_url: Option<&str>) -> String {
        let converted = if self.pipeline.contains(Pass::ConvertCharacters) {
            self.config.conversion_table.convert(html)
        } else {
            std::borrow::Cow::Borrowed(html)
        };

        let doc = Document::parse(&converted);
        let whitelisted = self.config.is_whitelisted(source_url);

        for pass in self.pipeline.passes().iter().filter(|p| !p.is_text_level()) {
            match pass {
                Pass::DowngradeUrls => {
                    let rewritten = passes::downgrade_urls(&doc);
                    debug!(rewritten, "downgraded urls");
                }
                Pass::SimplifyStructure if whitelisted => {
                    debug!(?source_url, "whitelisted, structure kept");
                }
                Pass::SimplifyStructure => passes::simplify_structure(&doc, &self.config),
                Pass::DowngradeRefresh => passes::downgrade_refresh_meta(&doc),
                Pass::DowngradeInlineCss => passes::downgrade_inline_css(&doc),
                Pass::RasterizeSvg => {
                    if let Some(sink) = &self.images {
                        passes::rasterize_svg(&doc, sink.as_ref());
                    }
                }
                Pass::ConvertCharacters => {}
            }
        }

        serialize::serialize(&doc, self.config.output)
    }
}

/// One-shot form of [`Transcoder::transcode`].
pub fn simplify(body: &[u8], config: &TranscodeConfig, source_url: Option<&str>) -> String {
    Transcoder::new(config.clone()).transcode(body, source_url)
}
