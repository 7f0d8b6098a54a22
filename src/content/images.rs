//! Image post-processing through the re-encoder cache.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{ContentHandler, GatewayResponse};
use crate::image::ImageCache;

/// Re-encodes `image/*` responses for the legacy display.
///
/// The cache is keyed by the source URL, so an image a rewriter returns
/// twice is converted once. When caching fails the original bytes go out.
pub struct ImageHandler {
    cache: Arc<ImageCache>,
}

impl ImageHandler {
    pub fn new(cache: Arc<ImageCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ContentHandler for ImageHandler {
    fn supported_types(&self) -> &[&str] {
        &["image/*"]
    }

    async fn process(&self, response: GatewayResponse, source_url: &str) -> Result<GatewayResponse> {
        if !self.cache.options().is_active() || !response.status.is_success() {
            return Ok(response);
        }

        if response.content_type().as_deref() == Some("image/svg+xml") {
            let svg = response.text_body();
            return Ok(match self.cache.store_svg_blocking(svg).await {
                Ok(entry) => {
                    let (bytes, mime) = self.cache.read(&entry.file_name).await?;
                    response.with_body(&mime, bytes)
                }
                Err(e) => {
                    debug!(error = %e, "SVG passed through");
                    response
                }
            });
        }

        let Some(entry) = self.cache.store(source_url, &response.body).await else {
            return Ok(response);
        };
        let (bytes, cached_mime) = self.cache.read(&entry.file_name).await?;
        // Unconverted entries keep whatever type upstream declared.
        let mime = if self.cache.options().convert {
            cached_mime
        } else {
            response.content_type().unwrap_or(cached_mime)
        };
        Ok(response.with_body(&mime, bytes))
    }
}
