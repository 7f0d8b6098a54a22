//! HTML post-processing through the simplifier.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{ContentHandler, GatewayResponse};
use crate::transcode::Transcoder;

/// Runs HTML responses through the [`Transcoder`].
///
/// Transcoding parses, rewrites and may rasterize inline SVG, so it runs on
/// the blocking pool.
pub struct HtmlHandler {
    transcoder: Arc<Transcoder>,
}

impl HtmlHandler {
    pub fn new(transcoder: Transcoder) -> Self {
        Self {
            transcoder: Arc::new(transcoder),
        }
    }
}

#[async_trait]
impl ContentHandler for HtmlHandler {
    fn supported_types(&self) -> &[&str] {
        &["text/html", "application/xhtml+xml"]
    }

    async fn process(&self, response: GatewayResponse, source_url: &str) -> Result<GatewayResponse> {
        let transcoder = Arc::clone(&self.transcoder);
        let body = response.body.clone();
        let source_url = source_url.to_string();
        let html = tokio::task::spawn_blocking(move || transcoder.transcode(&body, Some(&source_url))).await?;
        Ok(response.with_body("text/html", html))
    }
}
